//! Layer option syntax.
//!
//! A layer option is a comma-separated token list. The first token may name a
//! layer archive; every other token is a `key=value` pair or a bare key. A
//! token carrying `=` is always an option, whatever its value ends with.

use std::path::PathBuf;

use crate::archive::is_layer_file;
use crate::core::error::{LayerError, LayerResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedOption {
    pub key: String,
    pub value: Option<String>,
}

/// A parsed layer option.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LayerOption {
    pub layer_file: Option<PathBuf>,
    pub extended: Vec<ExtendedOption>,
}

impl LayerOption {
    pub fn parse(text: &str) -> LayerResult<Self> {
        let malformed = |reason: String| LayerError::MalformedLayerOption {
            option: text.to_string(),
            reason,
        };

        let mut option = LayerOption::default();
        for (position, token) in text.split(',').enumerate() {
            let token = token.trim();
            if token.is_empty() {
                return Err(malformed(format!("empty token at position {}", position)));
            }
            if !token.contains('=') && is_layer_file(token) {
                if position != 0 {
                    return Err(malformed(format!(
                        "layer file '{}' must be the first token",
                        token
                    )));
                }
                option.layer_file = Some(PathBuf::from(token));
                continue;
            }

            let (key, value) = match token.split_once('=') {
                Some((key, value)) => {
                    if value.is_empty() {
                        return Err(malformed(format!("option '{}' has an empty value", key)));
                    }
                    (key, Some(value.to_string()))
                }
                None => (token, None),
            };
            if key.is_empty() {
                return Err(malformed(format!("empty key in token '{}'", token)));
            }
            option.extended.push(ExtendedOption {
                key: key.to_string(),
                value,
            });
        }
        Ok(option)
    }

    /// Value of `key`: `Some(None)` for a bare key, `None` if absent.
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.extended
            .iter()
            .find(|option| option.key == key)
            .map(|option| option.value.as_deref())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_file_then_options() {
        let option = LayerOption::parse("out/libbase.nil,module=java.base,verbose").unwrap();
        assert_eq!(option.layer_file, Some(PathBuf::from("out/libbase.nil")));
        assert_eq!(option.get("module"), Some(Some("java.base")));
        assert_eq!(option.get("verbose"), Some(None));
        assert!(!option.has("missing"));
    }

    #[test]
    fn test_options_without_layer_file() {
        let option = LayerOption::parse("path=a,b").unwrap();
        assert!(option.layer_file.is_none());
        assert_eq!(option.extended.len(), 2);
    }

    #[test]
    fn test_option_values_naming_archives() {
        let option = LayerOption::parse("libbase.nil,path=out/libapp.nil").unwrap();
        assert_eq!(option.layer_file, Some(PathBuf::from("libbase.nil")));
        assert_eq!(option.get("path"), Some(Some("out/libapp.nil")));

        let option = LayerOption::parse("module=libfoo.nil").unwrap();
        assert!(option.layer_file.is_none());
        assert_eq!(option.get("module"), Some(Some("libfoo.nil")));
    }

    #[test]
    fn test_malformed_options() {
        for bad in ["", "a,,b", "=x", "key=", "opt,libbase.nil"] {
            let err = LayerOption::parse(bad).unwrap_err();
            assert!(
                matches!(err, LayerError::MalformedLayerOption { .. }),
                "{bad:?} gave {err:?}"
            );
            assert!(err.is_user_facing());
        }
    }
}
