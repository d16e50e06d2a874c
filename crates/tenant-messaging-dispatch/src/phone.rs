//! Phone number normalization.

use tenant_messaging_core::MessagingConfig;

/// Maps user-entered phone numbers to canonical destination ids.
///
/// Total and deterministic: any input yields an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneNormalizer {
    country_code: String,
    trunk_prefix: String,
    suffix: String,
}

impl PhoneNormalizer {
    #[must_use]
    pub fn new(
        country_code: impl Into<String>,
        trunk_prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            country_code: country_code.into(),
            trunk_prefix: trunk_prefix.into(),
            suffix: suffix.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &MessagingConfig) -> Self {
        Self::new(
            config.country_code.as_str(),
            config.trunk_prefix.as_str(),
            config.destination_suffix.as_str(),
        )
    }

    /// Digits only, with the country code, without the suffix.
    #[must_use]
    pub fn canonical_number(&self, raw: &str) -> String {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();

        let local = (!self.trunk_prefix.is_empty())
            .then(|| digits.strip_prefix(self.trunk_prefix.as_str()))
            .flatten();
        if let Some(local) = local {
            return format!("{}{local}", self.country_code);
        }
        if digits.starts_with(self.country_code.as_str()) {
            return digits;
        }
        format!("{}{digits}", self.country_code)
    }

    /// Destination id for `raw`, e.g. `923001234567@s.whatsapp.net`.
    #[must_use]
    pub fn normalize(&self, raw: &str) -> String {
        format!("{}{}", self.canonical_number(raw), self.suffix)
    }
}

impl Default for PhoneNormalizer {
    fn default() -> Self {
        Self::from_config(&MessagingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_formats_agree() {
        let normalizer = PhoneNormalizer::default();
        for raw in ["0300-1234567", "3001234567", "+923001234567", "+92 300 1234567"] {
            assert_eq!(normalizer.normalize(raw), "923001234567@s.whatsapp.net", "{raw}");
        }
    }

    #[test]
    fn test_other_country_codes() {
        let normalizer = PhoneNormalizer::new("44", "0", "@s.whatsapp.net");
        assert_eq!(normalizer.normalize("07700 900123"), "447700900123@s.whatsapp.net");
        assert_eq!(normalizer.normalize("+44 7700 900123"), "447700900123@s.whatsapp.net");
    }

    #[test]
    fn test_no_trunk_prefix() {
        let normalizer = PhoneNormalizer::new("1", "", "@c.us");
        assert_eq!(normalizer.normalize("(555) 010-9999"), "15550109999@c.us");
    }

    #[test]
    fn test_garbage_input_is_total() {
        let normalizer = PhoneNormalizer::default();
        assert_eq!(normalizer.normalize(""), "92@s.whatsapp.net");
        assert_eq!(normalizer.normalize("n/a"), "92@s.whatsapp.net");
    }
}
