//! Board bring-up and interrupt wiring for the thermal-spectrum bridge.
//!
//! Binds the three interrupt vectors spec'd in the design (`TIM3` for the
//! motor-timer tick, `EXTI9_5` for the WRITE-edge, `TIM2`/`ADC1_2` for the
//! thermal driver's pacer/calibration) to the library's state machines, then
//! runs the foreground loop: sleep until woken, and if a captured line is
//! waiting, print it. No other foreground work exists.
#![no_std]
#![no_main]

cfg_if::cfg_if! {
    if #[cfg(feature = "panic-itm")] {
        extern crate panic_itm as _;
    } else if #[cfg(feature = "panic-halt")] {
        extern crate panic_halt as _;
    }
}

use cortex_m_rt::entry;
use stm32f1::stm32f103 as device;
use stm32f1::stm32f103::interrupt;

use thermal_spectrum::thermal::hw::{StatusPin, Wfi};
use thermal_spectrum::thermal::ThermalPrinter;
use thermal_spectrum::util::armv7m::{clear_pending_irq, enable_irq};
use thermal_spectrum::util::spin_lock::SpinLock;
use thermal_spectrum::util::stm32::{configure_clocks, SYSTEM_CLOCK_CONFIG, TIM_CK_INT_HZ};
use thermal_spectrum::zxprinter::{LineCapture, ZxPrinterEmulator};
use thermal_spectrum::{priority, serial, thermal, zxprinter};

/// `TIM2` prescaler giving a 0.1 ms tick, the unit `ThermalPrinter`'s
/// `ms_div_10` timings are expressed in.
const PRINTER_TIM_PSC: u16 = (TIM_CK_INT_HZ / 10_000 - 1) as u16;
/// `TIM3` prescaler giving a 1 us tick, so `ARR` can be loaded directly with
/// [`zxprinter::HALF_STEP_PERIOD_US`].
const MOTOR_TIM_PSC: u16 = (TIM_CK_INT_HZ / 1_000_000 - 1) as u16;

const TX_LEN: usize = 64;
const RX_LEN: usize = 16;

type Emulator = ZxPrinterEmulator<'static, device::GPIOB, device::TIM3>;
type Printer =
    ThermalPrinter<'static, device::USART2, device::ADC1, device::TIM2, StatusPin<'static>>;

static LINE_CAPTURE: LineCapture = LineCapture::new();
static EMULATOR: SpinLock<Option<Emulator>> = SpinLock::new(None);

/// The printer driver is reached from both the foreground (`print_line`,
/// `init`) and two ISRs, all through `&self` methods that only touch
/// atomics and hardware registers; unlike `EMULATOR`, nothing here needs
/// mutual exclusion, so a plain one-shot-provisioned reference is enough —
/// and, critically, avoids holding a lock across `print_line`'s busy-wait.
static mut PRINTER: Option<&'static Printer> = None;

/// Pattern for acquiring hardware/state loaned to an ISR in a static: panics
/// if the lock is contended (two ISRs racing, or an ISR firing before
/// bring-up finished) or if the value hasn't been provisioned yet.
fn acquire_emulator() -> thermal_spectrum::util::spin_lock::SpinLockGuard<'static, Emulator> {
    thermal_spectrum::util::spin_lock::SpinLockGuard::map(
        EMULATOR.try_lock().expect("emulator lock held at ISR"),
        |o| o.as_mut().expect("ISR fired before emulator was provisioned"),
    )
}

fn printer() -> &'static Printer {
    // Safety: written once in `main` before any of TIM2/ADC1_2 are
    // unmasked; read-only from then on.
    unsafe { PRINTER }.expect("ISR fired before printer was provisioned")
}

#[interrupt]
fn TIM3() {
    // Safety: every ISR runs to completion before another of equal NVIC
    // priority is dispatched, so this token is never held concurrently with
    // another on this single core.
    let isr = unsafe { priority::Isr::new() };
    acquire_emulator().tim_handler(&isr);
}

#[interrupt]
fn EXTI9_5() {
    let isr = unsafe { priority::Isr::new() };
    acquire_emulator().write_handler(&isr);
    // WRITE is EXTI line 8; clear only that line's pending bit.
    unsafe { &*device::EXTI::ptr() }
        .pr
        .write(|w| w.pr8().set_bit());
}

#[interrupt]
fn TIM2() {
    let isr = unsafe { priority::Isr::new() };
    printer().tim_handler(&isr);
}

#[interrupt]
fn ADC1_2() {
    let isr = unsafe { priority::Isr::new() };
    printer().adc_handler(&isr);
}

#[entry]
fn main() -> ! {
    let p = device::Peripherals::take().unwrap();

    configure_clocks(&p.RCC, &p.FLASH, &SYSTEM_CLOCK_CONFIG);

    p.RCC.apb2enr.modify(|_, w| {
        w.iopaen()
            .set_bit()
            .iopben()
            .set_bit()
            .iopcen()
            .set_bit()
            .afioen()
            .set_bit()
            .adc1en()
            .set_bit()
    });
    p.RCC
        .apb1enr
        .modify(|_, w| w.tim2en().set_bit().tim3en().set_bit().usart2en().set_bit());

    // GPIOA: PA0 analog in (current sense), PA2 USART2 TX, PA3 USART2 RX.
    p.GPIOA.crl.modify(|_, w| {
        w.mode0()
            .bits(0b00)
            .cnf0()
            .bits(0b00)
            .mode2()
            .bits(0b11)
            .cnf2()
            .bits(0b10)
            .mode3()
            .bits(0b00)
            .cnf3()
            .bits(0b01)
    });

    // GPIOB: the seven ZX-Printer host bus pins. READY (7), PAPER (12),
    // ENCODER (13) are push-pull outputs; WRITE (8), STYLUS (9),
    // MOTOR_SLOW (14), MOTOR_OFF (15) are floating inputs.
    p.GPIOB
        .crl
        .modify(|_, w| w.mode7().bits(0b11).cnf7().bits(0b00));
    p.GPIOB.crh.modify(|_, w| {
        w.mode8()
            .bits(0b00)
            .cnf8()
            .bits(0b01)
            .mode9()
            .bits(0b00)
            .cnf9()
            .bits(0b01)
            .mode12()
            .bits(0b11)
            .cnf12()
            .bits(0b00)
            .mode13()
            .bits(0b11)
            .cnf13()
            .bits(0b00)
            .mode14()
            .bits(0b00)
            .cnf14()
            .bits(0b01)
            .mode15()
            .bits(0b00)
            .cnf15()
            .bits(0b01)
    });

    // GPIOC13: busy-status indicator, open-drain (mirrors the onboard-LED
    // wiring the original firmware reused for this purpose).
    p.GPIOC
        .crh
        .modify(|_, w| w.mode13().bits(0b10).cnf13().bits(0b01));

    // Route EXTI8 (WRITE, on port B) and arm its rising edge.
    p.AFIO
        .exticr3
        .modify(|_, w| unsafe { w.exti8().bits(0b01) });
    p.EXTI.imr.modify(|_, w| w.mr8().set_bit());
    p.EXTI.rtsr.modify(|_, w| w.tr8().set_bit());

    // USART2: 9600 baud, 8N1, on the 36 MHz APB1 peripheral clock.
    const APB1_PCLK_HZ: u32 = 36_000_000;
    const BAUD: u32 = 9600;
    p.USART2
        .brr
        .write(|w| unsafe { w.bits(APB1_PCLK_HZ / BAUD) });
    p.USART2
        .cr1
        .write(|w| w.ue().set_bit().te().set_bit().re().set_bit());

    // TIM2: the printer pacer's cooperative-sleep and busy-hold timer, 0.1ms
    // tick, one-shot (armed per-use by `ThermalPrinter`).
    p.TIM2.psc.write(|w| w.psc().bits(PRINTER_TIM_PSC));
    p.TIM2.dier.write(|w| w.uie().set_bit());

    // TIM3: the motor's half-step clock, free-running once started by the
    // emulator's write-edge handler.
    p.TIM3.psc.write(|w| w.psc().bits(MOTOR_TIM_PSC));
    p.TIM3
        .arr
        .write(|w| w.arr().bits(zxprinter::HALF_STEP_PERIOD_US as u16));
    p.TIM3.dier.write(|w| w.uie().set_bit());

    // Promote the peripherals the ISRs and stored state machines need to
    // reach, by reference, past `main`'s own stack frame.
    let gpiob = cortex_m::singleton!(: device::GPIOB = p.GPIOB).unwrap();
    let tim3 = cortex_m::singleton!(: device::TIM3 = p.TIM3).unwrap();
    let usart2 = cortex_m::singleton!(: device::USART2 = p.USART2).unwrap();
    let tim2 = cortex_m::singleton!(: device::TIM2 = p.TIM2).unwrap();
    let adc1 = cortex_m::singleton!(: device::ADC1 = p.ADC1).unwrap();
    let gpioc = cortex_m::singleton!(: device::GPIOC = p.GPIOC).unwrap();

    let (isr_capture, thread_capture) = LINE_CAPTURE.split();
    EMULATOR
        .lock()
        .replace(ZxPrinterEmulator::init(gpiob, tim3, isr_capture));

    // Safe to let the host start driving the bus and to let the motor timer
    // tick now that `EMULATOR` is provisioned.
    clear_pending_irq(device::Interrupt::TIM3);
    clear_pending_irq(device::Interrupt::EXTI9_5);
    unsafe {
        enable_irq(device::Interrupt::TIM3);
        enable_irq(device::Interrupt::EXTI9_5);
    }

    // Safety: `TX_REGION`/`RX_REGION` are touched only through the
    // `RingBuffer`s `SerialPort::init` hands them to, from this point on.
    static mut TX_REGION: [u8; TX_LEN] = [0; TX_LEN];
    static mut RX_REGION: [u8; RX_LEN] = [0; RX_LEN];
    let serial = cortex_m::singleton!(: serial::SerialPort<'static, device::USART2> =
        serial::SerialPort::init(usart2, unsafe { &mut TX_REGION }, unsafe { &mut RX_REGION }))
    .unwrap();

    let busy_pin = cortex_m::singleton!(: StatusPin<'static> = StatusPin {
        bsrr: &gpioc.bsrr,
        pin: 13,
    })
    .unwrap();

    let printer_mut = cortex_m::singleton!(: Printer =
        ThermalPrinter::new(serial, adc1, tim2, busy_pin))
    .unwrap();
    let printer_ref: &'static Printer = printer_mut;
    unsafe { PRINTER = Some(printer_ref) };

    clear_pending_irq(device::Interrupt::TIM2);
    clear_pending_irq(device::Interrupt::ADC1_2);
    unsafe {
        enable_irq(device::Interrupt::TIM2);
        enable_irq(device::Interrupt::ADC1_2);
    }

    // Runs the power-up bring-up and current calibration synchronously,
    // leaning on TIM2/ADC1_2 (just unmasked) and `Wfi` as its cooperative
    // sleep primitive. Leaves the printer idle and the watchdog armed.
    printer_ref.init(&Wfi);

    loop {
        cortex_m::asm::wfi();
        let thread = unsafe { priority::Thread::new() };
        if thread_capture.lines_in(&thread) > thread_capture.lines_out(&thread) {
            let line = thread_capture.take(&thread);
            let mut row = [0u8; thermal::ROW_BYTES];
            row[..line.len()].copy_from_slice(&line);
            printer_ref.print_line(&row, &Wfi);
            thread_capture.advance(&thread);
        }
    }
}
