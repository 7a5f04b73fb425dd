//! Request-path parsing and canonical key escaping
//!
//! Registry paths are case-sensitive but many filesystems and object stores
//! are not, so uppercase letters are case-encoded as `!` followed by the
//! lowercase letter (`github.com/Azure` becomes `github.com/!azure`) before
//! they are used as cache keys.

/// Kind of an immutable module artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Version metadata (JSON)
    Info,
    /// Module file
    Mod,
    /// Source archive
    Zip,
}

impl ArtifactKind {
    /// File extension for this kind.
    #[must_use]
    pub fn ext(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Mod => "mod",
            Self::Zip => "zip",
        }
    }

    /// Content type served for this kind.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Info => "application/json",
            Self::Mod => "text/plain; charset=utf-8",
            Self::Zip => "application/zip",
        }
    }

    fn from_ext(ext: &str) -> Option<Self> {
        match ext {
            "info" => Some(Self::Info),
            "mod" => Some(Self::Mod),
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }
}

/// A parsed module-proxy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModRequest {
    /// Immutable artifact: `<module>/@v/<version>.<ext>`
    Artifact {
        /// Module path, as requested
        module: String,
        /// Version string, as requested
        version: String,
        /// Artifact kind
        kind: ArtifactKind,
    },
    /// Mutable version probe: `<module>/@latest`
    Latest {
        /// Module path, as requested
        module: String,
    },
    /// Checksum-database lookup: `lookup/<module>@<version>`
    Lookup {
        /// Everything after `lookup/`
        rest: String,
    },
}

/// Parse a request path (leading slash already stripped).
#[must_use]
pub fn parse_path(path: &str) -> Option<ModRequest> {
    if path.is_empty() || path.starts_with('/') || path.contains("..") {
        return None;
    }

    if let Some(rest) = path.strip_prefix("lookup/") {
        if rest.is_empty() || !rest.contains('@') {
            return None;
        }
        return Some(ModRequest::Lookup {
            rest: rest.to_string(),
        });
    }

    if let Some(module) = path.strip_suffix("/@latest") {
        if module.is_empty() {
            return None;
        }
        return Some(ModRequest::Latest {
            module: module.to_string(),
        });
    }

    let (module, file) = path.rsplit_once("/@v/")?;
    if module.is_empty() {
        return None;
    }
    let (version, ext) = file.rsplit_once('.')?;
    if version.is_empty() {
        return None;
    }
    let kind = ArtifactKind::from_ext(ext)?;
    Some(ModRequest::Artifact {
        module: module.to_string(),
        version: version.to_string(),
        kind,
    })
}

/// Case-encode a module path or version for use as a cache key.
#[must_use]
pub fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_artifact() {
        let req = parse_path("example.com/foo/@v/v1.2.3.zip").unwrap();
        assert_eq!(
            req,
            ModRequest::Artifact {
                module: "example.com/foo".into(),
                version: "v1.2.3".into(),
                kind: ArtifactKind::Zip,
            }
        );

        let req = parse_path("example.com/foo/@v/v0.1.0.info").unwrap();
        assert!(matches!(
            req,
            ModRequest::Artifact {
                kind: ArtifactKind::Info,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_latest() {
        let req = parse_path("example.com/foo/@latest").unwrap();
        assert_eq!(
            req,
            ModRequest::Latest {
                module: "example.com/foo".into()
            }
        );
    }

    #[test]
    fn test_parse_lookup() {
        let req = parse_path("lookup/example.com/foo@v1.2.3").unwrap();
        assert_eq!(
            req,
            ModRequest::Lookup {
                rest: "example.com/foo@v1.2.3".into()
            }
        );
    }

    #[test]
    fn test_parse_rejects_junk() {
        assert!(parse_path("").is_none());
        assert!(parse_path("/leading/slash/@latest").is_none());
        assert!(parse_path("example.com/foo/@v/v1.2.3.tar").is_none());
        assert!(parse_path("example.com/foo/@v/.zip").is_none());
        assert!(parse_path("example.com/../../@v/v1.zip").is_none());
        assert!(parse_path("lookup/no-version").is_none());
        assert!(parse_path("/@latest").is_none());
    }

    #[test]
    fn test_escape_path() {
        assert_eq!(escape_path("github.com/Azure/SDK"), "github.com/!azure/!s!d!k");
        assert_eq!(escape_path("example.com/foo"), "example.com/foo");
    }
}
