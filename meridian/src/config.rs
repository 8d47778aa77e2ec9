//! Database catalog (`database.dat`) and buffer configuration
//! (`database.conf`) persistence, plus the runtime `Limits` they populate
//! (§6.1, §9).

pub mod tlv {
    //! Typed tag-length-value packer/unpacker for `database.dat` (§9:
    //! "Packer/unpacker for typed tag-length-value... encoding/decoding are
    //! inverse functions, property-tested").

    use crate::error::ConfigError;

    const TAG_UUID: u8 = 1;
    const TAG_NAME: u8 = 2;
    const TAG_PRECISION: u8 = 3;
    const TAG_BUFFER_SIZE: u8 = 4;
    const TAG_DURATION_NUM: u8 = 5;
    const TAG_DURATION_LOG: u8 = 6;
    const TAG_TIMEZONE: u8 = 7;
    const TAG_SHARD_MASK_NUM: u8 = 8;
    const TAG_SHARD_MASK_LOG: u8 = 9;

    /// One decoded `database.dat` field.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Field {
        /// Database UUID, 16 raw bytes.
        Uuid([u8; 16]),
        /// Database name.
        Name(String),
        /// Wall-clock precision tag (mirrors [`crate::point::Precision`]).
        Precision(u8),
        /// Configured per-series buffer size, in bytes.
        BufferSize(u32),
        /// Shard duration for numeric series, in seconds.
        DurationNum(u64),
        /// Shard duration for log(string) series, in seconds.
        DurationLog(u64),
        /// IANA timezone name (opaque to this crate, §1 out-of-scope
        /// collaborator).
        Timezone(String),
        /// Number of distinct shard masks for numeric series.
        ShardMaskNum(u16),
        /// Number of distinct shard masks for log(string) series.
        ShardMaskLog(u16),
    }

    fn write_tlv(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
        out.push(tag);
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(payload);
    }

    /// Encodes a sequence of fields into a `database.dat` byte stream.
    #[must_use]
    pub fn encode(fields: &[Field]) -> Vec<u8> {
        let mut out = Vec::new();
        for field in fields {
            match field {
                Field::Uuid(bytes) => write_tlv(&mut out, TAG_UUID, bytes),
                Field::Name(s) => write_tlv(&mut out, TAG_NAME, s.as_bytes()),
                Field::Precision(p) => write_tlv(&mut out, TAG_PRECISION, &[*p]),
                Field::BufferSize(n) => write_tlv(&mut out, TAG_BUFFER_SIZE, &n.to_le_bytes()),
                Field::DurationNum(n) => write_tlv(&mut out, TAG_DURATION_NUM, &n.to_le_bytes()),
                Field::DurationLog(n) => write_tlv(&mut out, TAG_DURATION_LOG, &n.to_le_bytes()),
                Field::Timezone(s) => write_tlv(&mut out, TAG_TIMEZONE, s.as_bytes()),
                Field::ShardMaskNum(n) => write_tlv(&mut out, TAG_SHARD_MASK_NUM, &n.to_le_bytes()),
                Field::ShardMaskLog(n) => write_tlv(&mut out, TAG_SHARD_MASK_LOG, &n.to_le_bytes()),
            }
        }
        out
    }

    /// Decodes a `database.dat` byte stream into its fields, in order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownTag`] for a tag outside the closed set
    /// above, or a read-failure-style error if the stream is truncated
    /// mid-record.
    pub fn decode(bytes: &[u8]) -> Result<Vec<Field>, ConfigError> {
        let mut fields = Vec::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            if pos + 3 > bytes.len() {
                return Err(ConfigError::ReadFailed {
                    path: "database.dat".to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "truncated tlv record header",
                    ),
                });
            }
            let tag = bytes[pos];
            let len = u16::from_le_bytes([bytes[pos + 1], bytes[pos + 2]]) as usize;
            let body_start = pos + 3;
            if body_start + len > bytes.len() {
                return Err(ConfigError::ReadFailed {
                    path: "database.dat".to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "truncated tlv record body",
                    ),
                });
            }
            let body = &bytes[body_start..body_start + len];
            let field = match tag {
                TAG_UUID => {
                    let mut uuid = [0u8; 16];
                    uuid.copy_from_slice(body);
                    Field::Uuid(uuid)
                }
                TAG_NAME => Field::Name(String::from_utf8_lossy(body).into_owned()),
                TAG_PRECISION => Field::Precision(body[0]),
                TAG_BUFFER_SIZE => Field::BufferSize(u32::from_le_bytes(body.try_into().unwrap())),
                TAG_DURATION_NUM => Field::DurationNum(u64::from_le_bytes(body.try_into().unwrap())),
                TAG_DURATION_LOG => Field::DurationLog(u64::from_le_bytes(body.try_into().unwrap())),
                TAG_TIMEZONE => Field::Timezone(String::from_utf8_lossy(body).into_owned()),
                TAG_SHARD_MASK_NUM => {
                    Field::ShardMaskNum(u16::from_le_bytes(body.try_into().unwrap()))
                }
                TAG_SHARD_MASK_LOG => {
                    Field::ShardMaskLog(u16::from_le_bytes(body.try_into().unwrap()))
                }
                other => return Err(ConfigError::UnknownTag { tag: other }),
            };
            fields.push(field);
            pos = body_start + len;
        }
        Ok(fields)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn roundtrip() {
            let fields = vec![
                Field::Uuid([7u8; 16]),
                Field::Name("prod-timeseries".to_string()),
                Field::Precision(2),
                Field::BufferSize(65536),
                Field::DurationNum(86400),
                Field::DurationLog(604800),
                Field::Timezone("UTC".to_string()),
                Field::ShardMaskNum(8),
                Field::ShardMaskLog(8),
            ];
            let encoded = encode(&fields);
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded, fields);
        }

        #[test]
        fn unknown_tag_rejected() {
            let bytes = [99u8, 1, 0, 0xAB];
            assert!(matches!(
                decode(&bytes).unwrap_err(),
                ConfigError::UnknownTag { tag: 99 }
            ));
        }

        #[test]
        fn truncated_stream_rejected() {
            let bytes = [TAG_NAME, 5, 0, b'h', b'i'];
            assert!(decode(&bytes).is_err());
        }
    }
}

pub mod ini {
    //! A minimal `[section] key = value` reader for `database.conf`, whose
    //! entire schema is the two-key `[buffer]` section (§6.1). Not a
    //! general-purpose INI parser; no crate dependency is justified for a
    //! two-key format the corpus itself hand-rolls equivalents of.

    use std::collections::HashMap;

    use crate::error::ConfigError;

    /// A parsed INI document: section name -> (key -> value).
    #[derive(Debug, Clone, Default)]
    pub struct IniDocument {
        sections: HashMap<String, HashMap<String, String>>,
    }

    impl IniDocument {
        /// Parses `text` into sections and key/value pairs. Blank lines and
        /// lines starting with `;` or `#` are ignored.
        #[must_use]
        pub fn parse(text: &str) -> Self {
            let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
            let mut current = String::new();
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                    continue;
                }
                if let Some(stripped) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                    current = stripped.trim().to_string();
                    sections.entry(current.clone()).or_default();
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    sections
                        .entry(current.clone())
                        .or_default()
                        .insert(key.trim().to_string(), value.trim().to_string());
                }
            }
            Self { sections }
        }

        /// Looks up `section.key`.
        ///
        /// # Errors
        ///
        /// Returns [`ConfigError::MissingKey`] if the section or key is
        /// absent.
        pub fn get(&self, section: &str, key: &str) -> Result<&str, ConfigError> {
            self.sections
                .get(section)
                .and_then(|kv| kv.get(key))
                .map(String::as_str)
                .ok_or_else(|| ConfigError::MissingKey {
                    section: section.to_string(),
                    key: key.to_string(),
                })
        }

        /// Renders this document back to INI text, in the `[buffer]` shape
        /// this crate writes.
        #[must_use]
        pub fn render(&self) -> String {
            let mut out = String::new();
            let mut section_names: Vec<&String> = self.sections.keys().collect();
            section_names.sort();
            for name in section_names {
                out.push_str(&format!("[{name}]\n"));
                let kv = &self.sections[name];
                let mut keys: Vec<&String> = kv.keys().collect();
                keys.sort();
                for key in keys {
                    out.push_str(&format!("{key} = {}\n", kv[key]));
                }
            }
            out
        }
    }

    /// The buffer path/size pair stored in `database.conf`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BufferConfig {
        /// Path to the sector buffer file.
        pub path: String,
        /// Configured buffer size in bytes (a multiple of 512 up to
        /// 1 MiB, §4.1).
        pub size: u32,
    }

    /// Parses a `database.conf` document's `[buffer]` section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingKey`] if `path`/`size` is absent, or
    /// [`ConfigError::InvalidValue`] if `size` does not parse as `u32`.
    pub fn parse_buffer_config(text: &str) -> Result<BufferConfig, ConfigError> {
        let doc = IniDocument::parse(text);
        let path = doc.get("buffer", "path")?.to_string();
        let size_str = doc.get("buffer", "size")?;
        let size = size_str.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
            section: "buffer".to_string(),
            key: "size".to_string(),
            reason: format!("not a valid u32: '{size_str}'"),
        })?;
        Ok(BufferConfig { path, size })
    }

    /// Renders a [`BufferConfig`] back to `database.conf` text.
    #[must_use]
    pub fn render_buffer_config(cfg: &BufferConfig) -> String {
        format!("[buffer]\npath = {}\nsize = {}\n", cfg.path, cfg.size)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_buffer_section() {
            let text = "[buffer]\npath = /var/lib/meridian/buffer.dat\nsize = 65536\n";
            let cfg = parse_buffer_config(text).unwrap();
            assert_eq!(cfg.path, "/var/lib/meridian/buffer.dat");
            assert_eq!(cfg.size, 65536);
        }

        #[test]
        fn missing_key_reported() {
            let text = "[buffer]\npath = x\n";
            assert!(matches!(
                parse_buffer_config(text).unwrap_err(),
                ConfigError::MissingKey { .. }
            ));
        }

        #[test]
        fn render_roundtrips() {
            let cfg = BufferConfig {
                path: "/data/buffer.dat".to_string(),
                size: 1024,
            };
            let rendered = render_buffer_config(&cfg);
            let parsed = parse_buffer_config(&rendered).unwrap();
            assert_eq!(parsed, cfg);
        }
    }
}

/// Runtime limits and thresholds derived from `database.dat` plus
/// deployment-local overrides (§7, §9 Open Question 3).
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    /// Buffer size in bytes, a multiple of 512 up to 1 MiB.
    pub buffer_size: u32,
    /// Maximum percentage of `series.dat` allowed to be lost to a
    /// truncated tail before startup aborts (DESIGN.md Open Question 3).
    pub max_catalog_truncation_pct: u8,
    /// Maximum number of concurrently memory-mapped file handles.
    pub max_open_files: u32,
}

impl Limits {
    /// Validates `buffer_size` against the §4.1 constraint (multiple of
    /// 512, at most 1 MiB) and constructs a [`Limits`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError::InvalidBufferSize`] if the
    /// constraint is violated.
    pub fn new(
        buffer_size: u32,
        max_catalog_truncation_pct: u8,
        max_open_files: u32,
    ) -> Result<Self, crate::error::ConfigError> {
        if buffer_size == 0 || buffer_size % 512 != 0 || buffer_size > 1024 * 1024 {
            return Err(crate::error::ConfigError::InvalidBufferSize { value: buffer_size });
        }
        Ok(Self {
            buffer_size,
            max_catalog_truncation_pct,
            max_open_files,
        })
    }

    /// Per-series buffer point capacity implied by `buffer_size`
    /// (`buffer_size / 16`, §4.1).
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.buffer_size as usize / 16
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            buffer_size: 65536,
            max_catalog_truncation_pct: 20,
            max_open_files: 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_len_is_size_over_sixteen() {
        let limits = Limits::new(512, 20, 512).unwrap();
        assert_eq!(limits.buffer_len(), 32);
    }

    #[test]
    fn rejects_non_multiple_of_512() {
        assert!(Limits::new(513, 20, 512).is_err());
    }

    #[test]
    fn rejects_over_one_mib() {
        assert!(Limits::new(2 * 1024 * 1024, 20, 512).is_err());
    }

    #[test]
    fn default_limits_match_spec_truncation_budget() {
        assert_eq!(Limits::default().max_catalog_truncation_pct, 20);
    }
}
