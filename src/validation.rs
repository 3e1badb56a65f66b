use std::collections::HashSet;

use log::debug;

use crate::{Error, FormPart};

/// The exact shape an upload must have before anything is forwarded.
#[derive(Debug, Clone)]
pub struct UploadSchema {
    fields: Vec<String>,
    extensions: Vec<String>,
}

impl UploadSchema {
    pub fn new<F, E>(fields: F, extensions: E) -> Self
    where
        F: IntoIterator,
        F::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            extensions: extensions
                .into_iter()
                .map(|ext| ext.into().to_ascii_lowercase())
                .collect(),
        }
    }

    /// A `background` and a `profile` image.
    pub fn images() -> Self {
        Self::new(["background", "profile"], ["gif", "jpg", "jpeg", "png"])
    }

    /// Checks the whole collected set at once: every required field exactly
    /// once, nothing else, and each file name carrying an allowed extension.
    pub fn validate<P: FormPart>(&self, parts: &[P]) -> Result<(), Error> {
        let mut seen = HashSet::new();

        for part in parts {
            let name = part.field_name();
            if !self.fields.iter().any(|field| field == name) {
                return Err(Error::Validation(format!("unexpected field \"{name}\"")));
            }
            if !seen.insert(name) {
                return Err(Error::Validation(format!("field \"{name}\" given more than once")));
            }
            if !part.is_file() {
                return Err(Error::Validation(format!("field \"{name}\" must be a file")));
            }
            if !self.allows(part.file_name()) {
                return Err(Error::Validation(format!(
                    "file \"{}\" in field \"{name}\" must be one of: {}",
                    part.file_name(),
                    self.extensions.join(", ")
                )));
            }
        }

        if let Some(missing) = self.fields.iter().find(|f| !seen.contains(f.as_str())) {
            return Err(Error::Validation(format!("field \"{missing}\" is required")));
        }

        debug!("Validated {} parts", parts.len());
        Ok(())
    }

    /// Matches the text after the last dot, so `.png` counts as a png.
    fn allows(&self, file_name: &str) -> bool {
        file_name
            .rsplit_once('.')
            .is_some_and(|(_, ext)| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }
}

impl Default for UploadSchema {
    fn default() -> Self {
        Self::images()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Field(&'static str, &'static str);

    impl FormPart for Field {
        fn field_name(&self) -> &str {
            self.0
        }

        fn file_name(&self) -> &str {
            self.1
        }
    }

    fn assert_rejected(parts: &[Field], needle: &str) {
        match UploadSchema::images().validate(parts) {
            Err(Error::Validation(msg)) => assert!(msg.contains(needle), "{msg}"),
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_accepts_both_images() {
        let parts = [Field("profile", "me.JPEG"), Field("background", "sky.png")];
        assert!(UploadSchema::images().validate(&parts).is_ok());

        let parts = [Field("background", "a.GIF"), Field("profile", "b.jpg")];
        assert!(UploadSchema::images().validate(&parts).is_ok());
    }

    #[test]
    fn test_rejects_empty_set() {
        assert_rejected(&[], "\"background\" is required");
    }

    #[test]
    fn test_rejects_missing_field() {
        assert_rejected(&[Field("background", "sky.png")], "\"profile\" is required");
    }

    #[test]
    fn test_rejects_text_field() {
        assert_rejected(
            &[Field("background", "sky.png"), Field("profile", "")],
            "must be a file",
        );
    }

    #[test]
    fn test_rejects_disallowed_extension() {
        assert_rejected(
            &[Field("background", "notes.txt"), Field("profile", "me.png")],
            "notes.txt",
        );
        assert_rejected(
            &[Field("background", "png"), Field("profile", "me.png")],
            "must be one of",
        );
    }

    #[test]
    fn test_extension_is_text_after_last_dot() {
        let parts = [Field("background", ".png"), Field("profile", "me.tar.GIF")];
        assert!(UploadSchema::images().validate(&parts).is_ok());

        assert_rejected(
            &[Field("background", "sky.png."), Field("profile", "me.png")],
            "sky.png.",
        );
        assert_rejected(
            &[Field("background", "sky.png.exe"), Field("profile", "me.png")],
            "must be one of",
        );
    }

    #[test]
    fn test_rejects_unknown_and_duplicate_fields() {
        assert_rejected(
            &[
                Field("background", "a.png"),
                Field("profile", "b.png"),
                Field("avatar", "c.png"),
            ],
            "unexpected field \"avatar\"",
        );
        assert_rejected(
            &[
                Field("background", "a.png"),
                Field("background", "b.png"),
                Field("profile", "c.png"),
            ],
            "more than once",
        );
    }
}
