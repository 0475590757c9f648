//! Thermal printer command pacer and current-sensing calibration.
//!
//! The printer's own firmware enforces the timing between commands; this
//! driver tracks that with a hardware timer and, once an analog-watchdog
//! threshold has been learned from the printer's own current draw, with the
//! watchdog itself — current stays elevated for as long as the print head is
//! actually burning dots, which outlasts the fixed post-command delay a
//! timer alone would give.

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};

use crate::priority;
use crate::serial::{SerialPort, UsartBus};

pub const POWER_UP_SETTLE_MS_DIV_10: u16 = 30_000;
pub const INIT_CMD: [u8; 2] = [0x1B, 0x40];
pub const AFTER_INIT_SETTLE_MS_DIV_10: u16 = 5_000;
/// Max simultaneously heated dots = `(0x03+1)*8 = 32`; heating time =
/// `0x70 * 10us = 1.12ms`; heating interval = `0x0C * 10us = 120us`.
pub const CONFIG_CMD: [u8; 5] = [0x1B, 0x37, 0x03, 0x70, 0x0C];
pub const AFTER_CONFIG_SETTLE_MS_DIV_10: u16 = 28;
pub const MEASURE_WINDOW_MS_DIV_10: u16 = 5_000;
pub const FEED_CMD: [u8; 3] = [0x1B, 0x4A, 0x03];
pub const IMAGE_CMD: [u8; 4] = [0x12, 0x2A, 0x01, 0x30];
pub const ROW_BYTES: usize = 48;
/// Time to consider the printer busy after the last above-threshold current
/// sample, tenths of a millisecond.
pub const BUSY_HOLD_MS_DIV_10: u16 = 1;

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Initializing = 0,
    MeasuringCurrentIdle = 1,
    MeasuringCurrentFeed = 2,
    Operating = 3,
}

/// Result of reading the ADC status register: which flag, if any, is set.
/// The watchdog flag takes priority when both are pending in the same poll.
pub enum AdcEvent {
    None,
    Awd,
    Eoc,
}

/// The ADC used to sense the printer's current draw.
pub trait Adc {
    fn start_continuous(&self);
    fn stop_continuous(&self);
    fn arm_watchdog(&self, high_threshold: u16);
    fn status(&self) -> AdcEvent;
    fn clear_awd(&self);
    /// Reads the converted sample, clearing the end-of-conversion flag.
    fn read_sample(&self) -> u16;
}

/// The timer used both as a cooperative-sleep primitive during bring-up and
/// as the busy-hold timer once operating.
pub trait PrinterTimer {
    fn schedule(&self, ms_div_10: u16);
    fn clear_interrupt(&self);
}

/// Low-power wait, woken by any interrupt.
pub trait IdleWait {
    fn wfi(&self);
}

/// An optional status-output pin mirroring the busy flag.
pub trait BusyIndicator {
    fn set(&self, busy: bool);
}

impl BusyIndicator for () {
    fn set(&self, _busy: bool) {}
}

pub struct ThermalPrinter<'a, U, A, Tm, P> {
    serial: &'a SerialPort<'a, U>,
    adc: &'a A,
    tim: &'a Tm,
    busy_gpio: &'a P,
    busy: AtomicBool,
    tim_running: AtomicBool,
    state: AtomicU8,
    idle_peak: AtomicU16,
    feed_peak: AtomicU16,
}

impl<'a, U, A, Tm, P> ThermalPrinter<'a, U, A, Tm, P>
where
    U: UsartBus,
    A: Adc,
    Tm: PrinterTimer,
    P: BusyIndicator,
{
    pub fn new(serial: &'a SerialPort<'a, U>, adc: &'a A, tim: &'a Tm, busy_gpio: &'a P) -> Self {
        ThermalPrinter {
            serial,
            adc,
            tim,
            busy_gpio,
            busy: AtomicBool::new(true),
            tim_running: AtomicBool::new(false),
            state: AtomicU8::new(State::Initializing as u8),
            idle_peak: AtomicU16::new(0),
            feed_peak: AtomicU16::new(0),
        }
    }

    fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Relaxed);
        self.busy_gpio.set(busy);
    }

    fn tim_sleep(&self, idle: &impl IdleWait, ms_div_10: u16) {
        debug_assert!(!self.tim_running.load(Ordering::Relaxed));
        self.tim.schedule(ms_div_10);
        self.tim_running.store(true, Ordering::Relaxed);
        while self.tim_running.load(Ordering::Relaxed) {
            idle.wfi();
        }
    }

    /// Runs the power-up bring-up and current calibration, then arms the
    /// watchdog and releases the printer for operation. Called exactly once.
    pub fn init(&self, idle: &impl IdleWait) {
        self.tim_sleep(idle, POWER_UP_SETTLE_MS_DIV_10);
        self.serial.transmit_blocking(&INIT_CMD);
        self.tim_sleep(idle, AFTER_INIT_SETTLE_MS_DIV_10);
        self.serial.transmit_blocking(&CONFIG_CMD);
        self.tim_sleep(idle, AFTER_CONFIG_SETTLE_MS_DIV_10);

        self.state
            .store(State::MeasuringCurrentIdle as u8, Ordering::Relaxed);
        self.adc.start_continuous();
        self.tim_sleep(idle, MEASURE_WINDOW_MS_DIV_10);

        self.state
            .store(State::MeasuringCurrentFeed as u8, Ordering::Relaxed);
        self.serial.transmit_blocking(&FEED_CMD);
        self.tim_sleep(idle, MEASURE_WINDOW_MS_DIV_10);
        self.adc.stop_continuous();

        let idle_peak = self.idle_peak.load(Ordering::Relaxed);
        let feed_peak = self.feed_peak.load(Ordering::Relaxed);
        let threshold = (idle_peak + feed_peak) / 2;

        self.state.store(State::Operating as u8, Ordering::Relaxed);
        self.adc.arm_watchdog(threshold);
        self.set_busy(false);
    }

    /// Blocks until the printer is not busy, sends one 384-dot row, then
    /// asserts busy. `row` is 48 bytes, 8 dots per byte, MSB-first.
    pub fn print_line(&self, row: &[u8; ROW_BYTES], idle: &impl IdleWait) {
        while self.busy.load(Ordering::Relaxed) {
            idle.wfi();
        }
        self.serial.transmit_blocking(&IMAGE_CMD);
        self.serial.transmit_blocking(row);
        self.set_busy(true);
    }

    /// Printer timer interrupt entry point.
    pub fn tim_handler(&self, _: &priority::Isr) {
        assert_eq!(self.tim_running.load(Ordering::Relaxed), true);
        if self.state.load(Ordering::Relaxed) == State::Operating as u8 {
            self.set_busy(false);
        }
        self.tim_running.store(false, Ordering::Relaxed);
        self.tim.clear_interrupt();
    }

    /// ADC interrupt entry point; demuxes on the watchdog and
    /// end-of-conversion flags, then on driver state.
    pub fn adc_handler(&self, _: &priority::Isr) {
        match self.adc.status() {
            AdcEvent::Awd => {
                if self.state.load(Ordering::Relaxed) == State::Operating as u8 {
                    self.set_busy(true);
                    self.tim.schedule(BUSY_HOLD_MS_DIV_10);
                    self.tim_running.store(true, Ordering::Relaxed);
                }
                self.adc.clear_awd();
            }
            AdcEvent::Eoc => {
                let sample = self.adc.read_sample();
                let state = self.state.load(Ordering::Relaxed);
                if state == State::MeasuringCurrentIdle as u8 {
                    if sample > self.idle_peak.load(Ordering::Relaxed) {
                        self.idle_peak.store(sample, Ordering::Relaxed);
                    }
                } else if state == State::MeasuringCurrentFeed as u8 {
                    if sample > self.feed_peak.load(Ordering::Relaxed) {
                        self.feed_peak.store(sample, Ordering::Relaxed);
                    }
                }
            }
            AdcEvent::None => {}
        }
    }
}

#[cfg(target_os = "none")]
pub mod hw {
    use super::{Adc, AdcEvent, BusyIndicator, IdleWait, PrinterTimer};
    use stm32f1::stm32f103 as device;

    /// Low-power wait shared by the driver's busy-wait and by `tim_sleep`.
    pub struct Wfi;

    impl IdleWait for Wfi {
        fn wfi(&self) {
            cortex_m::asm::wfi();
        }
    }

    /// At least 1us at 72MHz after powering up the ADC, before its
    /// configuration registers may be touched.
    fn adc_settle() {
        for _ in 0..36u32 {
            cortex_m::asm::nop();
        }
    }

    /// Regular-sequence channel carrying the printer's current-sense input
    /// (PA0 on this board). The driver only ever samples one channel, so
    /// this is wired in here rather than threaded through the `Adc` trait.
    const ADC_CHANNEL: u8 = 0;
    /// 28.5 ADC cycles, matching the original firmware's sample time.
    const SAMPLE_TIME: u8 = 0b011;

    impl Adc for device::ADC1 {
        fn start_continuous(&self) {
            self.cr2.modify(|_, w| w.adon().set_bit());
            adc_settle();
            self.smpr2
                .modify(|_, w| unsafe { w.smp0().bits(SAMPLE_TIME) });
            self.sqr1.modify(|_, w| unsafe { w.l().bits(0) });
            self.sqr3
                .modify(|_, w| unsafe { w.sq1().bits(ADC_CHANNEL) });
            self.cr1.modify(|_, w| w.eocie().set_bit());
            self.cr2.modify(|_, w| w.cont().set_bit());
            self.cr2.modify(|_, w| w.adon().set_bit());
        }

        fn stop_continuous(&self) {
            self.cr2.modify(|_, w| w.cont().clear_bit().adon().clear_bit());
            self.cr1.modify(|_, w| w.eocie().clear_bit());
        }

        fn arm_watchdog(&self, high_threshold: u16) {
            self.cr2.modify(|_, w| w.adon().set_bit());
            adc_settle();
            self.sqr1.modify(|_, w| unsafe { w.l().bits(0) });
            self.sqr3
                .modify(|_, w| unsafe { w.sq1().bits(ADC_CHANNEL) });
            self.ltr.write(|w| unsafe { w.lt().bits(0) });
            self.htr.write(|w| unsafe { w.ht().bits(high_threshold) });
            self.cr1.modify(|_, w| unsafe {
                w.awdch()
                    .bits(ADC_CHANNEL)
                    .awdsgl()
                    .set_bit()
                    .awdie()
                    .set_bit()
                    .awden()
                    .set_bit()
            });
            self.cr2.modify(|_, w| w.cont().set_bit());
            self.cr2.modify(|_, w| w.adon().set_bit());
        }

        fn status(&self) -> AdcEvent {
            let sr = self.sr.read();
            if sr.awd().bit_is_set() {
                AdcEvent::Awd
            } else if sr.eoc().bit_is_set() {
                AdcEvent::Eoc
            } else {
                AdcEvent::None
            }
        }

        fn clear_awd(&self) {
            self.sr.modify(|_, w| w.awd().clear_bit());
        }

        fn read_sample(&self) -> u16 {
            self.dr.read().data().bits()
        }
    }

    impl PrinterTimer for device::TIM2 {
        fn schedule(&self, ms_div_10: u16) {
            self.arr.write(|w| w.arr().bits(ms_div_10));
            self.egr.write(|w| w.ug().set_bit());
            self.cr1.modify(|_, w| w.cen().set_bit().opm().set_bit());
        }

        fn clear_interrupt(&self) {
            self.sr.write(|w| unsafe { w.bits(0) });
        }
    }

    /// A single push-pull output pin used as a busy status indicator.
    pub struct StatusPin<'a> {
        pub bsrr: &'a device::gpioc::BSRR,
        pub pin: u8,
    }

    impl<'a> BusyIndicator for StatusPin<'a> {
        fn set(&self, busy: bool) {
            if busy {
                self.bsrr.write(|w| unsafe { w.bits(1 << self.pin) });
            } else {
                self.bsrr.write(|w| unsafe { w.bits(1 << (self.pin + 16)) });
            }
        }
    }
}
