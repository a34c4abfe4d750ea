//! Enrollment form: the four text fields and their validation.

use crate::types::Identity;
use thiserror::Error;

/// Form field labels, in display order.
pub const FIELD_NAME: &str = "Name";
pub const FIELD_CLASS: &str = "Class";
pub const FIELD_ROLL_NO: &str = "Roll No";
pub const FIELD_SECTION: &str = "Section";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FormError {
    #[error("please fill in all fields ({})", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("{field} contains a path separator or control character")]
    InvalidCharacter { field: &'static str },
}

/// Raw, unvalidated form input.
#[derive(Debug, Clone, Default)]
pub struct EnrollmentForm {
    pub name: String,
    pub class: String,
    pub roll_no: String,
    pub section: String,
}

impl EnrollmentForm {
    pub fn new(
        name: impl Into<String>,
        class: impl Into<String>,
        roll_no: impl Into<String>,
        section: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            roll_no: roll_no.into(),
            section: section.into(),
        }
    }

    fn fields(&self) -> [(&'static str, &str); 4] {
        [
            (FIELD_NAME, self.name.as_str()),
            (FIELD_CLASS, self.class.as_str()),
            (FIELD_ROLL_NO, self.roll_no.as_str()),
            (FIELD_SECTION, self.section.as_str()),
        ]
    }

    /// Validate all four fields and produce a trimmed [`Identity`].
    ///
    /// Blank (whitespace-only) fields count as missing. Every missing field
    /// is reported at once.
    pub fn validate(&self) -> Result<Identity, FormError> {
        let missing: Vec<&'static str> = self
            .fields()
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(label, _)| *label)
            .collect();
        if !missing.is_empty() {
            return Err(FormError::Missing(missing));
        }

        for (label, value) in self.fields() {
            let value = value.trim();
            if value == "." || value == ".." || value.chars().any(is_forbidden) {
                return Err(FormError::InvalidCharacter { field: label });
            }
        }

        Ok(Identity {
            name: self.name.trim().to_string(),
            class: self.class.trim().to_string(),
            roll_no: self.roll_no.trim().to_string(),
            section: self.section.trim().to_string(),
        })
    }
}

fn is_forbidden(c: char) -> bool {
    c == '/' || c == '\\' || c.is_control()
}
