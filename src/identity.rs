use std::fmt;

use uuid::Uuid;

/// Per-run identifier used to correlate log lines: `{app_name}-{uuid}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn generate(app_name: &str) -> Self {
        Self(format!("{app_name}-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_app_name_and_is_unique() {
        let a = InstanceId::generate("kiosk");
        let b = InstanceId::generate("kiosk");
        assert!(a.as_str().starts_with("kiosk-"));
        assert_ne!(a, b);
        let token = a.as_str().trim_start_matches("kiosk-");
        assert!(Uuid::parse_str(token).is_ok());
    }
}
