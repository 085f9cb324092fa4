use std::ffi::CString;

use crate::ShmError;

/// A validated POSIX shared memory object name.
///
/// `shm_open` names are conventionally written with a leading `/` and no
/// other `/` in them. The fabric's own constants (`ktsnd_data_memory`,
/// `ktsnd_meta_memory`) are written without the leading slash, matching the
/// source's bare `shm_open(name, ...)` calls, so a missing leading slash is
/// normalised rather than rejected; an embedded slash is always rejected
/// since it would address a different directory under `/dev/shm`.
#[derive(Clone, Debug)]
pub struct ShmName(String);

impl ShmName {
    pub fn parse(raw: &str) -> Result<Self, ShmError> {
        if raw.is_empty() || raw[1..].contains('/') {
            return Err(ShmError::InvalidName(raw.to_string()));
        }
        let normalised = if raw.starts_with('/') {
            raw.to_string()
        } else {
            format!("/{raw}")
        };
        Ok(ShmName(normalised))
    }

    pub fn as_cstring(&self) -> CString {
        CString::new(self.0.as_str()).expect("shm name validated to contain no interior NUL")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_gets_leading_slash() {
        let n = ShmName::parse("ktsnd_data_memory").unwrap();
        assert_eq!(n.as_cstring().to_str().unwrap(), "/ktsnd_data_memory");
    }

    #[test]
    fn already_slashed_name_is_kept() {
        let n = ShmName::parse("/foo").unwrap();
        assert_eq!(n.as_cstring().to_str().unwrap(), "/foo");
    }

    #[test]
    fn interior_slash_is_rejected() {
        assert!(ShmName::parse("/a/b").is_err());
    }
}
