//! Form field validation
//!
//! Every missing field is reported at once so the user can fix the whole
//! form in one round.

use alloc::string::String;
use core::fmt::Write;

/// Most fields a single form carries
pub const MAX_FIELDS: usize = 8;

/// Labels of the fields that failed the check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingFields<'a> {
    labels: heapless::Vec<&'a str, MAX_FIELDS>,
}

impl<'a> MissingFields<'a> {
    pub fn labels(&self) -> &[&'a str] {
        &self.labels
    }

    /// `"<label> is missing."` per field, joined with `;`
    pub fn message(&self) -> String {
        let mut message = String::new();
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                message.push(';');
            }
            let _ = write!(message, "{} is missing.", label);
        }
        message
    }
}

/// Check every `(label, value)` pair; absent or empty values are missing
pub fn against_missing_bulk<'a>(fields: &[(&'a str, Option<&str>)]) -> Result<(), MissingFields<'a>> {
    let mut labels = heapless::Vec::new();
    for (label, value) in fields {
        if value.is_none_or(str::is_empty) && labels.push(*label).is_err() {
            break;
        }
    }

    if labels.is_empty() {
        Ok(())
    } else {
        Err(MissingFields { labels })
    }
}

/// First field whose value spans more than one line
///
/// Records are stored one field per line, so a value carrying `\r` or `\n`
/// could not be read back.
pub fn against_line_breaks<'a>(fields: &[(&'a str, Option<&str>)]) -> Result<(), &'a str> {
    match fields
        .iter()
        .find(|(_, value)| value.is_some_and(|v| v.contains(['\r', '\n'])))
    {
        Some((label, _)) => Err(*label),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_present_passes() {
        assert!(against_missing_bulk(&[("SSID", Some("Horta")), ("Password", Some("pw"))]).is_ok());
    }

    #[test]
    fn every_missing_field_is_reported() {
        let missing = against_missing_bulk(&[
            ("SSID", None),
            ("Password", Some("")),
            ("Other", Some("ok")),
        ])
        .unwrap_err();

        assert_eq!(missing.labels(), ["SSID", "Password"]);
        assert_eq!(missing.message(), "SSID is missing.;Password is missing.");
    }

    #[test]
    fn multi_line_values_are_flagged() {
        assert_eq!(
            against_line_breaks(&[("SSID", Some("Horta")), ("Password", Some("pw\r"))]),
            Err("Password")
        );
        assert_eq!(
            against_line_breaks(&[("Username", Some("ana\nbob")), ("CPF", None)]),
            Err("Username")
        );
        assert!(against_line_breaks(&[("SSID", Some("Minha Rede")), ("CPF", None)]).is_ok());
    }
}
