use strum_macros::Display;

/// Cloud API action named by a request's `a` parameter
///
/// Devices use several spellings of the same call across SDK versions, so all
/// but the token request match on substrings, checked in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Action {
    /// `s.gw.token.get`
    #[strum(to_string = "s.gw.token.get")]
    TokenGet,
    /// `s.gw.dev.pk.active` and friends
    #[strum(to_string = "s.gw.dev.pk.active")]
    Activate,
    #[strum(to_string = "s.gw.upgrade.updatestatus")]
    UpdateStatus,
    /// Upgrade check over the encrypted API
    #[strum(to_string = "s.gw.upgrade.get")]
    UpgradeGetEncrypted,
    #[strum(to_string = "tuya.device.upgrade.get")]
    DeviceUpgradeGet,
    /// Upgrade check over the plain API
    #[strum(to_string = "s.gw.upgrade")]
    LegacyUpgrade,
    #[strum(to_string = "atop.online.debug.log")]
    Log,
    #[strum(to_string = "s.gw.dev.timer.count")]
    Timer,
    #[strum(to_string = "tuya.device.dynamic.config.get")]
    DynamicConfig,
    /// Anything else; answered with an empty success
    #[strum(to_string = "generic")]
    Other(String),
}

impl Action {
    pub fn parse(a: &str, encrypted: bool) -> Self {
        if a == "s.gw.token.get" {
            Self::TokenGet
        } else if a.contains(".active") {
            Self::Activate
        } else if a.contains(".updatestatus") {
            Self::UpdateStatus
        } else if a.contains(".upgrade") && encrypted {
            Self::UpgradeGetEncrypted
        } else if a.contains(".device.upgrade") {
            Self::DeviceUpgradeGet
        } else if a.contains(".upgrade") {
            Self::LegacyUpgrade
        } else if a.contains(".log") {
            Self::Log
        } else if a.contains(".timer") {
            Self::Timer
        } else if a.contains(".config.get") {
            Self::DynamicConfig
        } else {
            Self::Other(a.to_string())
        }
    }

    /// Whether this is one of the upgrade checks
    pub fn is_upgrade_offer(&self) -> bool {
        matches!(
            self,
            Self::UpgradeGetEncrypted | Self::DeviceUpgradeGet | Self::LegacyUpgrade
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_table() {
        let cases = [
            ("s.gw.token.get", false, Action::TokenGet),
            ("s.gw.dev.pk.active", false, Action::Activate),
            ("s.gw.dev.active", true, Action::Activate),
            ("s.gw.upgrade.updatestatus", true, Action::UpdateStatus),
            ("s.gw.upgrade.get", true, Action::UpgradeGetEncrypted),
            ("tuya.device.upgrade.get", true, Action::UpgradeGetEncrypted),
            ("tuya.device.upgrade.get", false, Action::DeviceUpgradeGet),
            ("s.gw.upgrade", false, Action::LegacyUpgrade),
            ("atop.online.debug.log", false, Action::Log),
            ("s.gw.dev.timer.count", true, Action::Timer),
            ("tuya.device.dynamic.config.get", false, Action::DynamicConfig),
        ];
        for (a, encrypted, expected) in cases {
            assert_eq!(Action::parse(a, encrypted), expected, "a={a} et={encrypted}");
        }
    }

    #[test]
    fn test_token_get_is_exact_match() {
        assert_eq!(
            Action::parse("s.gw.token.get.v2", false),
            Action::Other("s.gw.token.get.v2".to_string())
        );
    }

    #[test]
    fn test_update_status_wins_over_upgrade() {
        // Contains ".upgrade" too, but status reports must not get an offer
        assert_eq!(Action::parse("s.gw.upgrade.updatestatus", false), Action::UpdateStatus);
    }

    #[test]
    fn test_unknown_and_missing() {
        assert_eq!(Action::parse("", false), Action::Other(String::new()));
        assert_eq!(Action::parse("0", false), Action::Other("0".to_string()));
        assert_eq!(Action::parse("s.gw.dev.schema", true).to_string(), "generic");
    }

    #[test]
    fn test_is_upgrade_offer() {
        assert!(Action::parse("s.gw.upgrade", false).is_upgrade_offer());
        assert!(!Action::parse("s.gw.upgrade.updatestatus", false).is_upgrade_offer());
    }
}
