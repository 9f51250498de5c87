use std::time::Duration;

use super::HidUsage;

pub const DEFAULT_TAP_MS: u64 = 40;
pub const DEFAULT_INTER_DELAY_MS: u64 = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroStep {
    pub usage: HidUsage,
    pub code: &'static str,
    /// Overrides the caller's tap duration for this step.
    pub hold: Option<Duration>,
}

impl MacroStep {
    pub const fn tap(usage: HidUsage, code: &'static str) -> Self {
        Self {
            usage,
            code,
            hold: None,
        }
    }

    pub const fn hold(usage: HidUsage, code: &'static str, hold_ms: u64) -> Self {
        Self {
            usage,
            code,
            hold: Some(Duration::from_millis(hold_ms)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroOutcome {
    pub total: usize,
    pub sent: usize,
}

impl MacroOutcome {
    pub fn completed(&self) -> bool {
        self.sent == self.total
    }
}

const POWER_ON: &[MacroStep] = &[MacroStep::tap(HidUsage::Consumer, "menu")];

const POWER_OFF: &[MacroStep] = &[
    MacroStep::hold(HidUsage::Consumer, "ac_home", 1_500),
    MacroStep::tap(HidUsage::Keyboard, "enter"),
];

const RETURN_HOME: &[MacroStep] = &[MacroStep::tap(HidUsage::Consumer, "ac_home")];

const APP_SWITCHER: &[MacroStep] = &[
    MacroStep::tap(HidUsage::Consumer, "ac_home"),
    MacroStep::tap(HidUsage::Consumer, "ac_home"),
];

/// Named sequences known to the backend command protocol.
pub fn lookup(name: &str) -> Option<&'static [MacroStep]> {
    match name {
        "power_on" => Some(POWER_ON),
        "power_off" => Some(POWER_OFF),
        "return_home" => Some(RETURN_HOME),
        "app_switcher" => Some(APP_SWITCHER),
        _ => None,
    }
}
