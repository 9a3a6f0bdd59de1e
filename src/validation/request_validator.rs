use std::collections::HashMap;

use crate::api::middleware::AppError;

const MAX_CALLBACK_LEN: usize = 128;

/// Checks inbound parameters before any backend work begins
pub struct RequestValidator;

impl RequestValidator {
    /// Fail with every required key that is absent or empty, in `required` order
    pub fn validate<S: AsRef<str>>(
        params: &HashMap<String, String>,
        required: &[S],
    ) -> Result<(), AppError> {
        let missing: Vec<String> = required
            .iter()
            .map(AsRef::as_ref)
            .filter(|key| params.get(*key).map_or(true, |v| v.is_empty()))
            .map(str::to_string)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::MissingParameters(missing))
        }
    }

    /// Restrict a JSONP callback to a dotted JavaScript identifier path
    pub fn validate_callback(callback: &str) -> Result<(), AppError> {
        if callback.len() > MAX_CALLBACK_LEN {
            return Err(AppError::InvalidCallback(format!(
                "callback longer than {} characters",
                MAX_CALLBACK_LEN
            )));
        }

        let well_formed = callback.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) if first.is_ascii_alphabetic() || first == '_' || first == '$' => {
                    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
                }
                _ => false,
            }
        });

        if well_formed {
            Ok(())
        } else {
            Err(AppError::InvalidCallback(format!(
                "`{}` is not a JavaScript identifier",
                callback
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DEFAULT_REQUIRED_PARAMETERS;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_complete_request_passes() {
        let p = params(&[
            ("database", "db"),
            ("select", "id"),
            ("from", "users"),
            ("callback", "cb"),
        ]);
        tokio_test::assert_ok!(RequestValidator::validate(&p, &DEFAULT_REQUIRED_PARAMETERS));
    }

    #[test]
    fn test_reports_every_missing_key_in_required_order() {
        let p = params(&[("from", "users"), ("database", "db")]);
        let err = RequestValidator::validate(&p, &DEFAULT_REQUIRED_PARAMETERS).unwrap_err();
        assert_eq!(
            err,
            AppError::MissingParameters(vec!["select".into(), "callback".into()])
        );
    }

    #[test]
    fn test_empty_value_counts_as_missing() {
        let p = params(&[
            ("database", ""),
            ("select", "id"),
            ("from", "users"),
            ("callback", "cb"),
        ]);
        let err = RequestValidator::validate(&p, &DEFAULT_REQUIRED_PARAMETERS).unwrap_err();
        assert_eq!(err, AppError::MissingParameters(vec!["database".into()]));
    }

    #[test]
    fn test_follows_configured_order() {
        let required = vec!["callback".to_string(), "database".to_string()];
        let err = RequestValidator::validate(&HashMap::new(), &required).unwrap_err();
        assert_eq!(
            err,
            AppError::MissingParameters(vec!["callback".into(), "database".into()])
        );
    }

    #[test]
    fn test_callback_grammar() {
        assert!(RequestValidator::validate_callback("cb").is_ok());
        assert!(RequestValidator::validate_callback("jQuery1910_1234").is_ok());
        assert!(RequestValidator::validate_callback("app.handlers.$done").is_ok());

        assert!(RequestValidator::validate_callback("").is_err());
        assert!(RequestValidator::validate_callback("1cb").is_err());
        assert!(RequestValidator::validate_callback("a..b").is_err());
        assert!(RequestValidator::validate_callback("alert(1);cb").is_err());
        assert!(RequestValidator::validate_callback(&"a".repeat(129)).is_err());
    }
}
