//! ZX Printer host interface emulator.
//!
//! Emulates the scanning-stylus/encoder-disc/paper-sense mechanics of a ZX
//! Printer closely enough that a ZX Spectrum driving the real printing
//! routine cannot tell the difference, while diverting the bits the stylus
//! would have burned into thermal paper into a line buffer for replay on a
//! real thermal print head.
//!
//! Host bus pins, all on one GPIO port:
//!
//! | Pin | Dir | Meaning |
//! |---|---|---|
//! | READY | out | high while the interface is alive |
//! | WRITE | in | rising edge: host wrote the bus |
//! | STYLUS | in | dot value being written |
//! | PAPER | out, latch | "stylus is on paper" |
//! | ENCODER | out, latch | "stylus over a dot position" |
//! | MOTOR_SLOW | in | half motor speed |
//! | MOTOR_OFF | in | motor disabled |
//!
//! A full stylus revolution is [`CYCLE_STEPS`] positions: a left margin, the
//! 256-dot printable line, a right margin, then an in-air return. Position 0
//! is the first step of the left margin; the revolution wraps modulo
//! [`CYCLE_STEPS`], so any starting position returns to itself after exactly
//! one revolution's worth of rising edges. The emulator boots mid in-air,
//! so the host reads `PAPER == 0` until the first margin step is reached.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::priority;

pub const READY_BIT: u16 = 7;
pub const WRITE_BIT: u16 = 8;
pub const STYLUS_BIT: u16 = 9;
pub const PAPER_BIT: u16 = 12;
pub const ENCODER_BIT: u16 = 13;
pub const MOTOR_SLOW_BIT: u16 = 14;
pub const MOTOR_OFF_BIT: u16 = 15;

const READY_MASK: u16 = 1 << READY_BIT;
const STYLUS_MASK: u16 = 1 << STYLUS_BIT;
const PAPER_MASK: u16 = 1 << PAPER_BIT;
const ENCODER_MASK: u16 = 1 << ENCODER_BIT;
const MOTOR_SLOW_MASK: u16 = 1 << MOTOR_SLOW_BIT;
const MOTOR_OFF_MASK: u16 = 1 << MOTOR_OFF_BIT;

const MARGIN_STEPS: u32 = 12;
const LINE_STEPS: u32 = 256;
const ON_PAPER_STEPS: u32 = MARGIN_STEPS + LINE_STEPS + MARGIN_STEPS;
const IN_AIR_STEPS: u32 = 140;
/// Positions in one stylus revolution.
pub const CYCLE_STEPS: u32 = ON_PAPER_STEPS + IN_AIR_STEPS;

const LINE_BYTES: usize = LINE_STEPS as usize / 8;

/// Duration of one full stylus revolution, milliseconds.
pub const CYCLE_MS: u32 = 48;
/// Duration of one cycle step, microseconds (~114 us).
pub const STEP_PERIOD_US: u32 = CYCLE_MS * 1000 / CYCLE_STEPS;
/// Motor timer tick period: half a cycle step (~57 us). `MOTOR_SLOW` makes
/// the emulator treat two ticks as one encoder level change instead of
/// reprogramming this period.
pub const HALF_STEP_PERIOD_US: u32 = STEP_PERIOD_US / 2;

fn on_paper(position: u32) -> bool {
    position < ON_PAPER_STEPS
}

fn on_line(position: u32) -> bool {
    position >= MARGIN_STEPS && position < MARGIN_STEPS + LINE_STEPS
}

/// The host-facing I/O port: pin reads and a single masked read-modify-write
/// for the output latches, so PAPER/ENCODER can be set or cleared without a
/// torn intermediate state visible to a concurrent ISR touching other bits
/// of the same register.
pub trait HostBus {
    fn read_pins(&self) -> u16;
    fn update_odr(&self, clear_mask: u16, set_mask: u16);
}

/// The timer driving the encoder disc. Ticks at a fixed half-step period
/// regardless of motor speed; `MOTOR_SLOW` only changes how many ticks make
/// up one encoder level change (see [`ZxPrinterEmulator::tim_handler`]).
pub trait MotorTimer {
    fn is_running(&self) -> bool;
    fn start(&self);
    /// Clears the timer's update-interrupt flag. Must be called from
    /// `tim_handler` before returning, or the ISR re-enters indefinitely.
    fn clear_interrupt(&self);
}

/// The captured line, split into an ISR-side writer and a foreground-side
/// reader, one counter pair gating visibility of the buffer between them.
///
/// `lines_in` is written by the ISR side (release) and read by the
/// foreground side (acquire); `lines_out` is written by the foreground side
/// (release) and read by the ISR side (acquire) to drive back-pressure.
pub struct LineCapture {
    data: UnsafeCell<[u8; LINE_BYTES]>,
    lines_in: AtomicU32,
    lines_out: AtomicU32,
}

// Safety: `data` is written only through `LineCaptureIsr` (one handle, used
// only from ISR context) and read only through `LineCaptureThread` (one
// handle, used only from thread context) after observing `lines_in` has
// advanced past `lines_out`, which happens-before the read by the
// release/acquire pairing on `lines_in`.
unsafe impl Sync for LineCapture {}

impl LineCapture {
    pub const fn new() -> Self {
        LineCapture {
            data: UnsafeCell::new([0; LINE_BYTES]),
            lines_in: AtomicU32::new(0),
            lines_out: AtomicU32::new(0),
        }
    }

    pub fn split(&self) -> (LineCaptureIsr<'_>, LineCaptureThread<'_>) {
        (LineCaptureIsr { buf: self }, LineCaptureThread { buf: self })
    }
}

pub struct LineCaptureIsr<'a> {
    buf: &'a LineCapture,
}

impl<'a> LineCaptureIsr<'a> {
    fn lines_in(&self) -> u32 {
        self.buf.lines_in.load(Ordering::Relaxed)
    }

    fn lines_out(&self, _: &priority::Isr) -> u32 {
        self.buf.lines_out.load(Ordering::Acquire)
    }

    fn set_dot(&mut self, dot: u32, bit: bool) {
        let byte = (dot >> 3) as usize;
        let mask = 1u8 << (7 - (dot & 7));
        // Safety: only the motor-timer ISR ever calls this, and it is the
        // sole writer of `data`.
        unsafe {
            let slot = &mut (*self.buf.data.get())[byte];
            if bit {
                *slot |= mask;
            } else {
                *slot &= !mask;
            }
        }
    }

    fn finish_line(&mut self) {
        self.buf.lines_in.fetch_add(1, Ordering::Release);
    }
}

pub struct LineCaptureThread<'a> {
    buf: &'a LineCapture,
}

impl<'a> LineCaptureThread<'a> {
    pub fn lines_in(&self, _: &priority::Thread) -> u32 {
        self.buf.lines_in.load(Ordering::Acquire)
    }

    pub fn lines_out(&self, _: &priority::Thread) -> u32 {
        self.buf.lines_out.load(Ordering::Relaxed)
    }

    /// Copies out the captured line. Call only once `lines_in()` has been
    /// observed to exceed `lines_out()`.
    pub fn take(&self, _: &priority::Thread) -> [u8; LINE_BYTES] {
        // Safety: the ISR side only mutates `data` before publishing the
        // matching `lines_in` increment; having observed that increment,
        // those writes happened-before this read.
        unsafe { *self.buf.data.get() }
    }

    pub fn advance(&self, _: &priority::Thread) {
        self.buf.lines_out.fetch_add(1, Ordering::Release);
    }
}

pub struct ZxPrinterEmulator<'a, B, T> {
    bus: &'a B,
    tim: &'a T,
    capture: LineCaptureIsr<'a>,
    clock_step: u32,
    clock_level: u32,
    cycle_step: u32,
}

// Safety: the motor-timer and write-edge interrupts that call this type's
// `&mut self` methods are wired at the same NVIC priority (see `main.rs`), so
// at most one of them is ever active; the `SpinLock` that holds this type in
// a `static` makes that non-reentrancy explicit instead of relying solely on
// the priority configuration.
unsafe impl<'a, B, T> Send for ZxPrinterEmulator<'a, B, T> {}

impl<'a, B: HostBus, T: MotorTimer> ZxPrinterEmulator<'a, B, T> {
    /// Brings the interface up: asserts READY, leaves the stylus in-air so
    /// the host sees `PAPER == 0` immediately after boot.
    pub fn init(bus: &'a B, tim: &'a T, capture: LineCaptureIsr<'a>) -> Self {
        bus.update_odr(0, READY_MASK);
        ZxPrinterEmulator {
            bus,
            tim,
            capture,
            clock_step: 0,
            clock_level: 0,
            cycle_step: CYCLE_STEPS - 1,
        }
    }

    /// Motor timer interrupt entry point: one half-step clock tick.
    pub fn tim_handler(&mut self, isr: &priority::Isr) {
        let pins = self.bus.read_pins();
        let motor_slow = (pins & MOTOR_SLOW_MASK) != 0;
        let motor_off = (pins & MOTOR_OFF_MASK) != 0;

        let next_clock_step = self.clock_step.wrapping_add(1);
        let shift = motor_slow as u32;
        let next_level = (next_clock_step >> shift) & 1;
        let rising = next_level == 1 && self.clock_level == 0;
        let falling = next_level == 0 && self.clock_level == 1;

        if rising && !motor_off {
            let prev_position = self.cycle_step;
            let candidate = (prev_position + 1) % CYCLE_STEPS;

            let would_leave_paper =
                prev_position == ON_PAPER_STEPS - 1 && candidate == ON_PAPER_STEPS;
            let stalled =
                would_leave_paper && self.capture.lines_out(isr) < self.capture.lines_in();

            if !stalled {
                self.cycle_step = candidate;

                let mut set_mask = 0u16;
                if on_paper(candidate) && !on_paper(prev_position) {
                    set_mask |= PAPER_MASK;
                }
                if on_line(candidate) && !on_line(prev_position) {
                    set_mask |= ENCODER_MASK;
                }
                if set_mask != 0 {
                    self.bus.update_odr(0, set_mask);
                }
            }
        }

        if falling {
            let position = self.cycle_step;
            if on_line(position) {
                let dot = position - MARGIN_STEPS;
                let stylus = (self.bus.read_pins() & STYLUS_MASK) != 0;
                self.capture.set_dot(dot, stylus);
                if dot + 1 == LINE_STEPS {
                    self.capture.finish_line();
                }
            }
        }

        self.clock_step = next_clock_step;
        self.clock_level = next_level;
        self.tim.clear_interrupt();
    }

    /// WRITE-edge external interrupt entry point.
    pub fn write_handler(&mut self, _: &priority::Isr) {
        self.bus.update_odr(PAPER_MASK | ENCODER_MASK, 0);

        let pins = self.bus.read_pins();
        let motor_on = (pins & MOTOR_OFF_MASK) == 0;
        if motor_on && !self.tim.is_running() {
            self.tim.start();
        }
    }
}

#[cfg(target_os = "none")]
mod hw {
    use super::{HostBus, MotorTimer};
    use stm32f1::stm32f103 as device;

    /// GPIOB carries all seven host bus signals (see the pin table above).
    impl HostBus for device::GPIOB {
        fn read_pins(&self) -> u16 {
            self.idr.read().bits() as u16
        }

        fn update_odr(&self, clear_mask: u16, set_mask: u16) {
            let prev = self.odr.read().bits();
            self.odr
                .write(|w| unsafe { w.bits((prev & !(clear_mask as u32)) | set_mask as u32) });
        }
    }

    /// TIM3 ticks at a fixed half-step period (see
    /// [`super::HALF_STEP_PERIOD_US`]); `MOTOR_SLOW` only changes how many
    /// ticks the emulator counts as one encoder level change, so the timer
    /// itself is simply kept running once started.
    impl MotorTimer for device::TIM3 {
        fn is_running(&self) -> bool {
            self.cr1.read().cen().bit_is_set()
        }

        fn start(&self) {
            self.egr.write(|w| w.ug().set_bit());
            self.cr1.modify(|_, w| w.cen().set_bit());
        }

        fn clear_interrupt(&self) {
            self.sr.write(|w| unsafe { w.bits(0) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct MockBus {
        pins: Cell<u16>,
        odr: Cell<u16>,
    }

    impl MockBus {
        fn new() -> Self {
            MockBus {
                pins: Cell::new(0),
                odr: Cell::new(0),
            }
        }

        fn set_stylus(&self, high: bool) {
            let mut pins = self.pins.get();
            if high {
                pins |= STYLUS_MASK;
            } else {
                pins &= !STYLUS_MASK;
            }
            self.pins.set(pins);
        }

        fn set_motor_slow(&self, slow: bool) {
            let mut pins = self.pins.get();
            if slow {
                pins |= MOTOR_SLOW_MASK;
            } else {
                pins &= !MOTOR_SLOW_MASK;
            }
            self.pins.set(pins);
        }
    }

    impl HostBus for MockBus {
        fn read_pins(&self) -> u16 {
            self.pins.get()
        }

        fn update_odr(&self, clear_mask: u16, set_mask: u16) {
            self.odr.set((self.odr.get() & !clear_mask) | set_mask);
        }
    }

    struct MockTimer {
        running: Cell<bool>,
    }

    impl MockTimer {
        fn new() -> Self {
            MockTimer {
                running: Cell::new(true),
            }
        }
    }

    impl MotorTimer for MockTimer {
        fn is_running(&self) -> bool {
            self.running.get()
        }
        fn start(&self) {
            self.running.set(true);
        }
        fn clear_interrupt(&self) {}
    }

    fn make() -> (LineCapture, MockBus, MockTimer) {
        (LineCapture::new(), MockBus::new(), MockTimer::new())
    }

    fn drive_revolution<B: HostBus, T: MotorTimer>(
        emu: &mut ZxPrinterEmulator<'_, B, T>,
        bus: &MockBus,
        isr: &priority::Isr,
        stylus_for_dot: impl Fn(u32) -> bool,
    ) {
        for _ in 0..CYCLE_STEPS {
            emu.tim_handler(isr);
            let position = emu.cycle_step;
            if on_line(position) {
                bus.set_stylus(stylus_for_dot(position - MARGIN_STEPS));
            }
            emu.tim_handler(isr);
        }
    }

    #[test]
    fn one_revolution_returns_cycle_step_to_its_start() {
        let (capture, bus, tim) = make();
        let (isr_capture, thread_capture) = capture.split();
        let isr = unsafe { priority::Isr::new() };
        let thread = unsafe { priority::Thread::new() };
        let mut emu = ZxPrinterEmulator::init(&bus, &tim, isr_capture);
        let start = emu.cycle_step;

        // Absent back-pressure (spec invariant 4): advance `lines_out` as
        // soon as the line completes so the right-margin exit isn't stalled.
        for _ in 0..CYCLE_STEPS {
            emu.tim_handler(&isr);
            let position = emu.cycle_step;
            if on_line(position) {
                bus.set_stylus(true);
            }
            emu.tim_handler(&isr);
            if thread_capture.lines_in(&thread) > thread_capture.lines_out(&thread) {
                thread_capture.advance(&thread);
            }
        }

        assert_eq!(emu.cycle_step, start);
    }

    #[test]
    fn scenario_d_stylus_held_high_captures_full_line() {
        let (capture, bus, tim) = make();
        let (isr_capture, thread_capture) = capture.split();
        let isr = unsafe { priority::Isr::new() };
        let thread = unsafe { priority::Thread::new() };
        let mut emu = ZxPrinterEmulator::init(&bus, &tim, isr_capture);

        drive_revolution(&mut emu, &bus, &isr, |_| true);

        assert_eq!(thread_capture.lines_in(&thread), 1);
        assert_eq!(thread_capture.take(&thread), [0xFFu8; LINE_BYTES]);
    }

    #[test]
    fn scenario_e_stylus_high_only_on_first_dot() {
        let (capture, bus, tim) = make();
        let (isr_capture, thread_capture) = capture.split();
        let isr = unsafe { priority::Isr::new() };
        let thread = unsafe { priority::Thread::new() };
        let mut emu = ZxPrinterEmulator::init(&bus, &tim, isr_capture);

        drive_revolution(&mut emu, &bus, &isr, |dot| dot == 0);

        let line = thread_capture.take(&thread);
        assert_eq!(line[0], 0x80);
        assert!(line[1..].iter().all(|&b| b == 0));
        assert_eq!(thread_capture.lines_in(&thread), 1);
    }

    #[test]
    fn scenario_f_back_pressure_stalls_second_line() {
        let (capture, bus, tim) = make();
        let (isr_capture, thread_capture) = capture.split();
        let isr = unsafe { priority::Isr::new() };
        let thread = unsafe { priority::Thread::new() };
        let mut emu = ZxPrinterEmulator::init(&bus, &tim, isr_capture);

        // lines_out is never advanced, simulating a foreground that never
        // catches up.
        drive_revolution(&mut emu, &bus, &isr, |_| true);
        assert_eq!(thread_capture.lines_in(&thread), 1);

        drive_revolution(&mut emu, &bus, &isr, |_| true);
        assert_eq!(
            thread_capture.lines_in(&thread),
            1,
            "back-pressure must hold lines_in at 1 while lines_out stays 0"
        );
    }

    #[test]
    fn scenario_f_resumes_once_foreground_catches_up() {
        let (capture, bus, tim) = make();
        let (isr_capture, thread_capture) = capture.split();
        let isr = unsafe { priority::Isr::new() };
        let thread = unsafe { priority::Thread::new() };
        let mut emu = ZxPrinterEmulator::init(&bus, &tim, isr_capture);

        drive_revolution(&mut emu, &bus, &isr, |_| true);
        assert_eq!(thread_capture.lines_in(&thread), 1);
        thread_capture.advance(&thread);

        drive_revolution(&mut emu, &bus, &isr, |_| true);
        assert_eq!(thread_capture.lines_in(&thread), 2);
    }

    #[test]
    fn motor_slow_halves_encoder_rate() {
        let (capture, bus, tim) = make();
        let (isr_capture, _thread_capture) = capture.split();
        let isr = unsafe { priority::Isr::new() };
        let mut emu = ZxPrinterEmulator::init(&bus, &tim, isr_capture);
        bus.set_motor_slow(true);

        let start = emu.cycle_step;
        emu.tim_handler(&isr); // tick 1: no edge yet
        assert_eq!(emu.cycle_step, start);
        emu.tim_handler(&isr); // tick 2: first rising edge
        let after_first_step = emu.cycle_step;
        assert_ne!(after_first_step, start);

        emu.tim_handler(&isr); // tick 3: falling
        emu.tim_handler(&isr); // tick 4: no edge
        assert_eq!(emu.cycle_step, after_first_step);
        emu.tim_handler(&isr); // tick 5: no edge
        assert_eq!(emu.cycle_step, after_first_step);
        emu.tim_handler(&isr); // tick 6: second rising edge, 4 ticks after the first
        assert_ne!(emu.cycle_step, after_first_step);
    }

    #[test]
    fn write_handler_clears_latches_and_restarts_stalled_timer() {
        let (capture, bus, tim) = make();
        let (isr_capture, _thread_capture) = capture.split();
        let isr = unsafe { priority::Isr::new() };
        let mut emu = ZxPrinterEmulator::init(&bus, &tim, isr_capture);

        bus.update_odr(0, PAPER_MASK | ENCODER_MASK);
        tim.running.set(false);
        emu.write_handler(&isr);

        assert_eq!(bus.odr.get() & (PAPER_MASK | ENCODER_MASK), 0);
        assert!(tim.is_running());
    }
}
