use std::sync::OnceLock;

use log::debug;

// TODO: a byte-based trigger (bytes freed since the last round) would track
// actual garbage better than the candidate count
#[derive(Debug, Default, Clone, Copy)]
pub struct CollectorCreateInfo {
    // candidates buffered before an automatic round runs
    pub threshold: Option<usize>,
    pub auto_collect: Option<bool>,
    // initial memo capacity of a freshly spawned label
    pub memo_capacity: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorSettings {
    pub threshold: usize,
    pub auto_collect: bool,
    pub memo_capacity: usize,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            threshold: 10_000,
            auto_collect: false,
            memo_capacity: 16,
        }
    }
}

impl CollectorSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.threshold == 0 {
            return Err("collection threshold must be at least one candidate");
        }
        if self.memo_capacity > (1 << 24) {
            return Err("memo capacity is unreasonably large");
        }
        Ok(())
    }
}

impl From<CollectorCreateInfo> for CollectorSettings {
    fn from(info: CollectorCreateInfo) -> Self {
        let mut settings = CollectorSettings::default();
        info.threshold.inspect(|&val| settings.threshold = val);
        info.auto_collect.inspect(|&val| settings.auto_collect = val);
        info.memo_capacity
            .inspect(|&val| settings.memo_capacity = val);
        settings
    }
}

static SETTINGS: OnceLock<CollectorSettings> = OnceLock::new();

/// Install process-wide settings. Must run before the first pointer is
/// dropped, later calls fail.
pub fn configure(info: CollectorCreateInfo) -> Result<(), &'static str> {
    let settings = CollectorSettings::from(info);
    settings.validate()?;
    SETTINGS
        .set(settings)
        .map_err(|_| "collector settings are already installed")?;
    debug!("collector configured: {settings:?}");
    Ok(())
}

#[inline]
pub fn settings() -> &'static CollectorSettings {
    SETTINGS.get_or_init(CollectorSettings::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_info_overrides_only_given_fields() {
        let settings = CollectorSettings::from(CollectorCreateInfo {
            threshold: Some(64),
            ..Default::default()
        });
        assert_eq!(settings.threshold, 64);
        assert!(!settings.auto_collect);
        assert_eq!(settings.memo_capacity, 16);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let settings = CollectorSettings::from(CollectorCreateInfo {
            threshold: Some(0),
            ..Default::default()
        });
        assert!(settings.validate().is_err());
        assert!(
            configure(CollectorCreateInfo {
                threshold: Some(0),
                ..Default::default()
            })
            .is_err(),
            "invalid settings are never installed"
        );
    }

    #[test]
    fn oversized_memo_is_rejected() {
        let settings = CollectorSettings {
            memo_capacity: usize::MAX,
            ..Default::default()
        };
        assert_eq!(
            settings.validate(),
            Err("memo capacity is unreasonably large")
        );
    }
}
