//! Simulator configuration
use vcore_alarm::CoreId;

/// The name of the environment variable read by [`PortConfig::from_env`].
const ENV_NUM_CORES: &str = "VCORE_NUM_CORES";

/// Where the port gets the current time from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSource {
    /// Microseconds elapsed since the port was created. Timer interrupts are
    /// delivered by timer threads.
    #[default]
    Host,
    /// A virtual clock that only moves by [`crate::Simulator::advance`].
    /// Timer interrupts are delivered by
    /// [`crate::Simulator::fire_due_timers`].
    Manual,
}

/// The configuration of [`crate::StdPort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConfig {
    /// The number of emulated cores. Defaults to three.
    pub num_cores: usize,
    pub clock: ClockSource,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            num_cores: 3,
            clock: ClockSource::Host,
        }
    }
}

impl PortConfig {
    /// Get the default configuration, overridden by environment variables.
    ///
    /// `VCORE_NUM_CORES` specifies the number of cores. Invalid values are
    /// ignored.
    pub fn from_env() -> Self {
        Self::default().with_env_var(std::env::var(ENV_NUM_CORES).ok().as_deref())
    }

    fn with_env_var(self, num_cores: Option<&str>) -> Self {
        let Some(value) = num_cores else {
            return self;
        };

        match value.trim().parse::<CoreId>() {
            Ok(num_cores) if num_cores > 0 => self.with_num_cores(num_cores),
            Ok(_) => {
                log::warn!("ignoring {ENV_NUM_CORES}={value:?}: need at least one core");
                self
            }
            Err(e) => {
                log::warn!("ignoring {ENV_NUM_CORES}={value:?}: {e}");
                self
            }
        }
    }

    pub fn with_num_cores(self, num_cores: usize) -> Self {
        Self { num_cores, ..self }
    }

    pub fn with_clock(self, clock: ClockSource) -> Self {
        Self { clock, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn defaults() {
        let config = PortConfig::default();
        assert_eq!(config.num_cores, 3);
        assert_eq!(config.clock, ClockSource::Host);
    }

    #[test]
    fn builder() {
        let config = PortConfig::default()
            .with_num_cores(1)
            .with_clock(ClockSource::Manual);
        assert_eq!(
            config,
            PortConfig {
                num_cores: 1,
                clock: ClockSource::Manual
            }
        );
    }

    #[test]
    fn env_override() {
        let base = PortConfig::default().with_clock(ClockSource::Manual);
        assert_eq!(base.with_env_var(None), base);
        assert_eq!(base.with_env_var(Some("8")).num_cores, 8);
        assert_eq!(base.with_env_var(Some(" 2\n")).num_cores, 2);
        assert_eq!(base.with_env_var(Some("8")).clock, ClockSource::Manual);
    }

    #[test]
    fn invalid_env_override_is_ignored() {
        let _ = env_logger::try_init();
        let base = PortConfig::default();
        assert_eq!(base.with_env_var(Some("0")), base);
        assert_eq!(base.with_env_var(Some("-1")), base);
        assert_eq!(base.with_env_var(Some("many")), base);
    }

    #[quickcheck]
    fn env_override_accepts_any_core_count(num_cores: usize) -> bool {
        let config = PortConfig::default().with_env_var(Some(&num_cores.to_string()));
        if num_cores == 0 {
            config == PortConfig::default()
        } else {
            config.num_cores == num_cores
        }
    }
}
