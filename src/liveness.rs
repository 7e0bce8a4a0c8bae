use sysinfo::System;

/// Answers whether a consumer application is still running.
pub trait ProcessProbe: Send {
    fn is_running(&mut self, application: &str) -> bool;
}

/// Process table lookup by executable name.
pub struct SystemProbe {
    system: System,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl std::fmt::Debug for SystemProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProbe").finish_non_exhaustive()
    }
}

/// Process name without a trailing `.exe`.
fn process_stem(name: &str) -> &str {
    name.strip_suffix(".exe").unwrap_or(name)
}

impl ProcessProbe for SystemProbe {
    fn is_running(&mut self, application: &str) -> bool {
        self.system.refresh_processes();
        self.system
            .processes()
            .values()
            .any(|process| process_stem(process.name()) == application)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_stem() {
        assert_eq!(process_stem("TherapyDesktopV2.exe"), "TherapyDesktopV2");
        assert_eq!(process_stem("TherapyDesktopV2"), "TherapyDesktopV2");
    }

    #[test]
    fn test_missing_application() {
        let mut probe = SystemProbe::new();
        assert!(!probe.is_running("no-such-consumer-application-7f3a"));
    }
}
