//! Augmented STM32F1 operations.
//!
//! This is a set of extensions and workarounds for the `stm32f1` crate,
//! covering the HSI-to-PLL clock switch-over that bare register access
//! makes tedious to get right: bus dividers and flash wait states have to be
//! set before the frequency rises, and the crystal and PLL each need to be
//! waited on before anything downstream can rely on them.

use stm32f1::stm32f103 as device;

macro_rules! block_while {
    ($condition:expr) => {
        while $condition {}
    };
}

macro_rules! block_until {
    ($condition:expr) => {
        block_while!(!$condition)
    };
}

/// Clock tree configuration: 8 MHz HSE crystal, PLL x9, giving the 72 MHz
/// system clock (and CK_INT figure) that the emulator and driver timing
/// constants in this crate assume throughout.
pub struct ClockConfig {
    pub pll_mul: device::rcc::cfgr::PLLMULW,
    pub ahb_divisor: device::rcc::cfgr::HPREW,
    pub apb1_divisor: device::rcc::cfgr::PPRE1W,
    pub apb2_divisor: device::rcc::cfgr::PPRE2W,
    pub flash_latency: device::flash::acr::LATENCYW,
}

/// The clock configuration used by this firmware: 8 MHz HSE * 9 = 72 MHz
/// SYSCLK, APB1 limited to 36 MHz (its maximum), APB2 and AHB left at 72 MHz.
pub const SYSTEM_CLOCK_CONFIG: ClockConfig = ClockConfig {
    pll_mul: device::rcc::cfgr::PLLMULW::Mul9,
    ahb_divisor: device::rcc::cfgr::HPREW::Div1,
    apb1_divisor: device::rcc::cfgr::PPRE1W::Div2,
    apb2_divisor: device::rcc::cfgr::PPRE2W::Div1,
    flash_latency: device::flash::acr::LATENCYW::TwoStates,
};

/// Frequency of the clock ultimately fed to the APB1 peripheral timers
/// (TIM2/TIM3) once `configure_clocks` has run with `SYSTEM_CLOCK_CONFIG`.
///
/// On the F1, when the APB1 prescaler is not 1, the timer clock is doubled
/// relative to the APB1 peripheral clock, which is how a /2 APB1 divisor
/// still yields the 72 MHz CK_INT this firmware's timer constants assume.
pub const TIM_CK_INT_HZ: u32 = 72_000_000;

/// Applies `cfg` to `rcc` and `flash`, switching the system clock from the
/// power-on HSI default to the HSE-driven PLL.
///
/// The algorithm mirrors the VGA driver's `configure_clocks`: apply bus
/// dividers before raising frequency, bring up the crystal and PLL, then
/// switch SYSCLK over only once the PLL is locked.
pub fn configure_clocks(
    rcc: &device::RCC,
    flash: &device::FLASH,
    cfg: &ClockConfig,
) {
    // Two wait states are required above 48 MHz at 3.3V (RM0008 Table 6).
    flash
        .acr
        .modify(|_, w| w.latency().variant(cfg.flash_latency));

    // Apply bus divisors before boosting the system clock frequency.
    rcc.cfgr.modify(|_, w| {
        w.hpre()
            .variant(cfg.ahb_divisor)
            .ppre1()
            .variant(cfg.apb1_divisor)
            .ppre2()
            .variant(cfg.apb2_divisor)
    });

    // Switch on the crystal oscillator and wait for it to stabilize.
    rcc.cr.modify(|_, w| w.hseon().set_bit());
    block_until! { rcc.cr.read().hserdy().bit() }

    // Configure and enable the PLL, sourced from HSE (not HSE/2).
    rcc.cfgr
        .modify(|_, w| w.pllsrc().set_bit().pllmul().variant(cfg.pll_mul));
    rcc.cr.modify(|_, w| w.pllon().set_bit());
    block_until! { rcc.cr.read().pllrdy().bit() }

    // Select the PLL as the system clock source.
    rcc.cfgr
        .modify(|_, w| w.sw().pll());
    block_until! { rcc.cfgr.read().sws().is_pll() }
}
