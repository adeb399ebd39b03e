//! Core type definitions for vaultio
//!
//! Validated newtypes for bucket and object names plus the small shared
//! records that cross crate boundaries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a bucket, validated against DNS-compatible
/// S3 naming rules.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketName(String);

impl BucketName {
    /// Create a new bucket name (validates S3 naming rules)
    pub fn new(name: impl Into<String>) -> Result<Self, BucketNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the bucket name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate bucket name according to S3 rules
    pub fn validate(name: &str) -> Result<(), BucketNameError> {
        if name.len() < 3 {
            return Err(BucketNameError::TooShort);
        }
        if name.len() > 63 {
            return Err(BucketNameError::TooLong);
        }

        let first = name.chars().next().unwrap();
        if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
            return Err(BucketNameError::InvalidStartChar);
        }

        let last = name.chars().last().unwrap();
        if !last.is_ascii_lowercase() && !last.is_ascii_digit() {
            return Err(BucketNameError::InvalidEndChar);
        }

        for c in name.chars() {
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '.' {
                return Err(BucketNameError::InvalidChar(c));
            }
        }

        if name.contains("..") {
            return Err(BucketNameError::ConsecutivePeriods);
        }

        if name.parse::<std::net::Ipv4Addr>().is_ok() {
            return Err(BucketNameError::LooksLikeIpAddress);
        }

        Ok(())
    }
}

impl fmt::Debug for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketName({:?})", self.0)
    }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur when creating a bucket name
#[derive(Debug, Clone, thiserror::Error)]
pub enum BucketNameError {
    #[error("bucket name must be at least 3 characters")]
    TooShort,
    #[error("bucket name must be at most 63 characters")]
    TooLong,
    #[error("bucket name must start with a lowercase letter or number")]
    InvalidStartChar,
    #[error("bucket name must end with a lowercase letter or number")]
    InvalidEndChar,
    #[error("bucket name contains invalid character: {0}")]
    InvalidChar(char),
    #[error("bucket name cannot contain consecutive periods")]
    ConsecutivePeriods,
    #[error("bucket name cannot be formatted as an IP address")]
    LooksLikeIpAddress,
}

/// Object key (path within a bucket); may embed `/`-separated segments.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Create a new object key
    pub fn new(key: impl Into<String>) -> Result<Self, ObjectKeyError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the object key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate object key
    pub fn validate(key: &str) -> Result<(), ObjectKeyError> {
        if key.is_empty() {
            return Err(ObjectKeyError::Empty);
        }
        if key.len() > 1024 {
            return Err(ObjectKeyError::TooLong);
        }
        // Path traversal through the key would escape the bucket root.
        if key.split('/').any(|seg| seg == ".." || seg == ".") {
            return Err(ObjectKeyError::InvalidSegment);
        }
        if key.starts_with('/') {
            return Err(ObjectKeyError::LeadingSlash);
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({:?})", self.0)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur when creating an object key
#[derive(Debug, Clone, thiserror::Error)]
pub enum ObjectKeyError {
    #[error("object key cannot be empty")]
    Empty,
    #[error("object key cannot exceed 1024 bytes")]
    TooLong,
    #[error("object key cannot contain '.' or '..' segments")]
    InvalidSegment,
    #[error("object key cannot start with '/'")]
    LeadingSlash,
}

/// Bucket information returned by stat/list operations
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    /// Bucket name
    pub name: String,
    /// Creation time, nanoseconds since the Unix epoch
    pub created: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_name_valid() {
        assert!(BucketName::new("my-bucket").is_ok());
        assert!(BucketName::new("bucket123").is_ok());
        assert!(BucketName::new("a.b.c").is_ok());
    }

    #[test]
    fn test_bucket_name_invalid() {
        assert!(BucketName::new("ab").is_err()); // Too short
        assert!(BucketName::new("-bucket").is_err()); // Invalid start
        assert!(BucketName::new("bucket-").is_err()); // Invalid end
        assert!(BucketName::new("Bucket").is_err()); // Uppercase
        assert!(BucketName::new("bucket..name").is_err()); // Consecutive periods
        assert!(BucketName::new("192.168.1.1").is_err()); // IP address
    }

    #[test]
    fn test_object_key_valid() {
        assert!(ObjectKey::new("file.txt").is_ok());
        assert!(ObjectKey::new("deep/nested/path/file.bin").is_ok());
    }

    #[test]
    fn test_object_key_invalid() {
        assert!(ObjectKey::new("").is_err());
        assert!(ObjectKey::new("/leading").is_err());
        assert!(ObjectKey::new("a/../b").is_err());
        assert!(ObjectKey::new("./x").is_err());
    }
}
