//! The `target` argument the runtime passes a `stopns`/`stop` hook
//! invocation: `stop` or `reboot`.

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookTarget {
    Stop,
    Reboot,
}

impl HookTarget {
    pub fn is_reboot(self) -> bool {
        matches!(self, HookTarget::Reboot)
    }
}

impl std::str::FromStr for HookTarget {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(HookTarget::Stop),
            "reboot" => Ok(HookTarget::Reboot),
            other => Err(CoreError::HookInvalidTarget(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_targets() {
        assert_eq!("stop".parse::<HookTarget>().unwrap(), HookTarget::Stop);
        assert_eq!("reboot".parse::<HookTarget>().unwrap(), HookTarget::Reboot);
    }

    #[test]
    fn rejects_unknown_target() {
        assert!(matches!(
            "pause".parse::<HookTarget>().unwrap_err(),
            CoreError::HookInvalidTarget(_)
        ));
    }
}
