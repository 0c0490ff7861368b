//! Attribution Suffix Codec
//!
//! Decodes builder codes from the fixed tail that attribution-aware wallets append to
//! transaction calldata. The tail is read from the end of the input backward:
//!
//! ```text
//! schema 0: [codes][codesLength:1][schemaId=0:1][marker:16]
//! schema 1: [codes][codesLength:1][chainId:chainIdLength][chainIdLength:1][registryAddress:20][schemaId=1:1][marker:16]
//! ```
//!
//! Decoding is total: anything malformed yields no codes.

use alloy::primitives::{Address, Bytes};
use thiserror::Error;

/// Trailing 16-byte marker signalling an attribution suffix
pub const SUFFIX_MARKER: [u8; 16] = [
    0x80, 0x21, 0x80, 0x21, 0x80, 0x21, 0x80, 0x21, 0x80, 0x21, 0x80, 0x21, 0x80, 0x21, 0x80, 0x21,
];

/// Schema id of the canonical registry layout
pub const SCHEMA_CANONICAL: u8 = 0;

/// Schema id of the custom registry layout
pub const SCHEMA_CUSTOM_REGISTRY: u8 = 1;

/// Separator between codes in the codes region
pub const CODE_SEPARATOR: u8 = b',';

/// Maximum encoded length of the joined codes string
pub const MAX_CODES_LENGTH: usize = u8::MAX as usize;

/// Smallest input that can carry a schema id after the marker
const MIN_SUFFIX_LEN: usize = SUFFIX_MARKER.len() + 1;

const REGISTRY_ADDRESS_LEN: usize = 20;

/// Errors that can occur while building a suffix
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodeError {
    #[error("At least one builder code is required")]
    NoCodes,

    #[error("Builder code is empty")]
    EmptyCode,

    #[error("Builder code {0:?} contains a comma")]
    CodeContainsSeparator(String),

    #[error("Builder code {0:?} is not ASCII")]
    NonAsciiCode(String),

    #[error("Joined codes are {0} bytes, maximum is 255")]
    CodesTooLong(usize),

    #[error("Registry chain id is {0} bytes, maximum is 255")]
    ChainIdTooLong(usize),
}

/// Registry layout declared by the suffix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuffixSchema {
    /// Schema 0: codes resolve against the canonical registry
    Canonical,
    /// Schema 1: codes resolve against a registry on an explicit chain
    CustomRegistry {
        /// Big-endian chain id bytes, as carried on the wire
        chain_id: Bytes,
        /// Registry contract address
        registry: Address,
    },
}

impl SuffixSchema {
    /// Wire value of the schema id byte
    pub fn id(&self) -> u8 {
        match self {
            SuffixSchema::Canonical => SCHEMA_CANONICAL,
            SuffixSchema::CustomRegistry { .. } => SCHEMA_CUSTOM_REGISTRY,
        }
    }
}

/// A decoded attribution suffix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributionSuffix {
    pub schema: SuffixSchema,
    /// Codes in left-to-right order, empty segments removed
    pub codes: Vec<String>,
}

/// Reads fields from the end of a buffer toward its start
struct TailReader<'a> {
    buf: &'a [u8],
    end: usize,
}

impl<'a> TailReader<'a> {
    fn new(buf: &'a [u8], end: usize) -> Self {
        Self { buf, end }
    }

    fn take_back(&mut self, len: usize) -> Option<&'a [u8]> {
        let start = self.end.checked_sub(len)?;
        let field = &self.buf[start..self.end];
        self.end = start;
        Some(field)
    }

    fn byte_back(&mut self) -> Option<u8> {
        self.take_back(1).map(|b| b[0])
    }
}

/// Check whether the input ends with the attribution marker
pub fn has_suffix_marker(data: &[u8]) -> bool {
    data.len() >= MIN_SUFFIX_LEN && data.ends_with(&SUFFIX_MARKER)
}

/// Decode the attribution suffix of a transaction's input
///
/// # Arguments
/// * `data` - The raw transaction input (calldata)
///
/// # Returns
/// `Some(AttributionSuffix)` if a well-formed suffix with a known schema is present,
/// `None` for everything else, including unknown schema ids
pub fn decode_suffix(data: &[u8]) -> Option<AttributionSuffix> {
    if !has_suffix_marker(data) {
        return None;
    }

    let mut reader = TailReader::new(data, data.len() - SUFFIX_MARKER.len());
    let schema_id = reader.byte_back()?;

    let schema = match schema_id {
        SCHEMA_CANONICAL => SuffixSchema::Canonical,
        SCHEMA_CUSTOM_REGISTRY => {
            let registry = Address::from_slice(reader.take_back(REGISTRY_ADDRESS_LEN)?);
            let chain_id_len = reader.byte_back()? as usize;
            let chain_id = Bytes::copy_from_slice(reader.take_back(chain_id_len)?);
            SuffixSchema::CustomRegistry { chain_id, registry }
        }
        // Unknown schemas stop parsing
        _ => return None,
    };

    let codes_len = reader.byte_back()? as usize;
    if codes_len == 0 {
        return None;
    }
    let codes = split_codes(reader.take_back(codes_len)?)?;

    Some(AttributionSuffix { schema, codes })
}

/// Extract the builder codes attributed by a transaction's input
///
/// Never fails: input without a valid suffix yields an empty list.
pub fn parse_builder_codes(data: &[u8]) -> Vec<String> {
    decode_suffix(data).map(|suffix| suffix.codes).unwrap_or_default()
}

fn split_codes(region: &[u8]) -> Option<Vec<String>> {
    if !region.is_ascii() {
        return None;
    }
    let joined = std::str::from_utf8(region).ok()?;
    Some(
        joined
            .split(CODE_SEPARATOR as char)
            .filter(|code| !code.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Validate a single builder code against the wire constraints
pub fn validate_code(code: &str) -> Result<(), EncodeError> {
    if code.is_empty() {
        return Err(EncodeError::EmptyCode);
    }
    if !code.is_ascii() {
        return Err(EncodeError::NonAsciiCode(code.to_string()));
    }
    if code.as_bytes().contains(&CODE_SEPARATOR) {
        return Err(EncodeError::CodeContainsSeparator(code.to_string()));
    }
    if code.len() > MAX_CODES_LENGTH {
        return Err(EncodeError::CodesTooLong(code.len()));
    }
    Ok(())
}

/// Encode an attribution suffix
///
/// The output is the exact byte tail `decode_suffix` consumes.
pub fn encode_suffix(suffix: &AttributionSuffix) -> Result<Vec<u8>, EncodeError> {
    if suffix.codes.is_empty() {
        return Err(EncodeError::NoCodes);
    }
    for code in &suffix.codes {
        validate_code(code)?;
    }

    let joined = suffix.codes.join(",");
    if joined.len() > MAX_CODES_LENGTH {
        return Err(EncodeError::CodesTooLong(joined.len()));
    }

    let mut out = Vec::with_capacity(joined.len() + 64);
    out.extend_from_slice(joined.as_bytes());
    out.push(joined.len() as u8);

    if let SuffixSchema::CustomRegistry { chain_id, registry } = &suffix.schema {
        if chain_id.len() > u8::MAX as usize {
            return Err(EncodeError::ChainIdTooLong(chain_id.len()));
        }
        out.extend_from_slice(chain_id);
        out.push(chain_id.len() as u8);
        out.extend_from_slice(registry.as_slice());
    }

    out.push(suffix.schema.id());
    out.extend_from_slice(&SUFFIX_MARKER);
    Ok(out)
}

/// Append a canonical (schema 0) suffix carrying `codes` to existing calldata
pub fn append_suffix<S: AsRef<str>>(calldata: &[u8], codes: &[S]) -> Result<Bytes, EncodeError> {
    let suffix = AttributionSuffix {
        schema: SuffixSchema::Canonical,
        codes: codes.iter().map(|c| c.as_ref().to_string()).collect(),
    };
    let tail = encode_suffix(&suffix)?;
    let mut out = Vec::with_capacity(calldata.len() + tail.len());
    out.extend_from_slice(calldata);
    out.extend_from_slice(&tail);
    Ok(Bytes::from(out))
}

/// Parse a hex string to bytes (with or without 0x prefix)
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(hex_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn schema0(codes: &[u8]) -> Vec<u8> {
        let mut out = codes.to_vec();
        out.push(codes.len() as u8);
        out.push(SCHEMA_CANONICAL);
        out.extend_from_slice(&SUFFIX_MARKER);
        out
    }

    // ==================== marker tests ====================

    #[test]
    fn test_input_without_marker_yields_nothing() {
        let calldata = hex_to_bytes("0xa9059cbb000000000000000000000000f39fd6e51aad88f6f4ce6ab8827279cfffb92266").unwrap();
        assert!(parse_builder_codes(&calldata).is_empty());
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        assert!(parse_builder_codes(&[]).is_empty());
    }

    #[test]
    fn test_marker_alone_is_too_short() {
        assert!(!has_suffix_marker(&SUFFIX_MARKER));
        assert!(parse_builder_codes(&SUFFIX_MARKER).is_empty());
    }

    #[test]
    fn test_corrupted_marker_yields_nothing() {
        let mut data = schema0(b"abc");
        let last = data.len() - 1;
        data[last] = 0x20;
        assert!(parse_builder_codes(&data).is_empty());
    }

    #[test]
    fn test_unknown_schema_yields_nothing() {
        let mut data = vec![99u8];
        data.extend_from_slice(&SUFFIX_MARKER);
        assert_eq!(data.len(), 17);
        assert!(parse_builder_codes(&data).is_empty());
    }

    #[test]
    fn test_unknown_schema_with_valid_codes_yields_nothing() {
        let mut data = schema0(b"abc");
        let schema_pos = data.len() - SUFFIX_MARKER.len() - 1;
        data[schema_pos] = 2;
        assert!(decode_suffix(&data).is_none());
    }

    // ==================== schema 0 tests ====================

    #[test]
    fn test_schema0_single_code() {
        assert_eq!(parse_builder_codes(&schema0(b"dexwiz")), vec!["dexwiz"]);
    }

    #[test]
    fn test_schema0_multiple_codes_keep_order() {
        assert_eq!(parse_builder_codes(&schema0(b"abc,def")), vec!["abc", "def"]);
    }

    #[test]
    fn test_schema0_discards_empty_segments() {
        assert_eq!(parse_builder_codes(&schema0(b",x,,y,")), vec!["x", "y"]);
    }

    #[test]
    fn test_schema0_only_separators_yields_nothing() {
        assert!(parse_builder_codes(&schema0(b",,,")).is_empty());
    }

    #[test]
    fn test_schema0_after_real_calldata() {
        let mut data = hex_to_bytes("0x38ed17390000000000000000000000000000000000000000000000000de0b6b3a7640000").unwrap();
        data.extend_from_slice(&schema0(b"lenderx"));
        assert_eq!(parse_builder_codes(&data), vec!["lenderx"]);
    }

    #[test]
    fn test_schema0_zero_length_yields_nothing() {
        let mut data = vec![0u8, SCHEMA_CANONICAL];
        data.extend_from_slice(&SUFFIX_MARKER);
        assert!(parse_builder_codes(&data).is_empty());
    }

    #[test]
    fn test_schema0_length_exceeding_buffer_yields_nothing() {
        let mut data = b"abc".to_vec();
        data.push(10);
        data.push(SCHEMA_CANONICAL);
        data.extend_from_slice(&SUFFIX_MARKER);
        assert!(parse_builder_codes(&data).is_empty());
    }

    #[test]
    fn test_schema0_missing_length_byte_yields_nothing() {
        let mut data = vec![SCHEMA_CANONICAL];
        data.extend_from_slice(&SUFFIX_MARKER);
        assert!(parse_builder_codes(&data).is_empty());
    }

    #[test]
    fn test_schema0_codes_fill_whole_prefix() {
        // Codes region starting at offset 0 is valid
        let data = schema0(b"a");
        assert_eq!(data.len(), 19);
        assert_eq!(parse_builder_codes(&data), vec!["a"]);
    }

    #[test]
    fn test_schema0_non_ascii_yields_nothing() {
        assert!(parse_builder_codes(&schema0(&[b'a', 0xc3, 0xa9])).is_empty());
    }

    // ==================== schema 1 tests ====================

    #[test]
    fn test_schema1_decodes_registry_fields() {
        let registry = address!("1111111111111111111111111111111111111111");
        let mut data = b"x,y".to_vec();
        data.push(3);
        data.extend_from_slice(&[0x21, 0x05]); // 8453
        data.push(2);
        data.extend_from_slice(registry.as_slice());
        data.push(SCHEMA_CUSTOM_REGISTRY);
        data.extend_from_slice(&SUFFIX_MARKER);

        let suffix = decode_suffix(&data).unwrap();
        assert_eq!(suffix.codes, vec!["x", "y"]);
        assert_eq!(
            suffix.schema,
            SuffixSchema::CustomRegistry {
                chain_id: Bytes::from(vec![0x21, 0x05]),
                registry,
            }
        );
    }

    #[test]
    fn test_schema1_truncated_address_yields_nothing() {
        let mut data = vec![0u8; 10];
        data.push(SCHEMA_CUSTOM_REGISTRY);
        data.extend_from_slice(&SUFFIX_MARKER);
        assert!(parse_builder_codes(&data).is_empty());
    }

    #[test]
    fn test_schema1_chain_id_length_underflow_yields_nothing() {
        let mut data = vec![200u8];
        data.extend_from_slice(&[0u8; 20]);
        data.push(SCHEMA_CUSTOM_REGISTRY);
        data.extend_from_slice(&SUFFIX_MARKER);
        assert!(parse_builder_codes(&data).is_empty());
    }

    #[test]
    fn test_schema1_codes_length_underflow_yields_nothing() {
        let mut data = vec![50u8, 0x01, 1];
        data.extend_from_slice(&[0u8; 20]);
        data.push(SCHEMA_CUSTOM_REGISTRY);
        data.extend_from_slice(&SUFFIX_MARKER);
        assert!(parse_builder_codes(&data).is_empty());
    }

    #[test]
    fn test_schema1_empty_chain_id() {
        let suffix = AttributionSuffix {
            schema: SuffixSchema::CustomRegistry {
                chain_id: Bytes::new(),
                registry: Address::repeat_byte(0x22),
            },
            codes: vec!["solo".to_string()],
        };
        let encoded = encode_suffix(&suffix).unwrap();
        assert_eq!(decode_suffix(&encoded), Some(suffix));
    }

    // ==================== encoding tests ====================

    #[test]
    fn test_encode_schema0_layout_is_bit_exact() {
        let suffix = AttributionSuffix {
            schema: SuffixSchema::Canonical,
            codes: vec!["abc".to_string(), "def".to_string()],
        };
        let encoded = encode_suffix(&suffix).unwrap();
        assert_eq!(&encoded[..7], b"abc,def");
        assert_eq!(encoded[7], 7);
        assert_eq!(encoded[8], SCHEMA_CANONICAL);
        assert_eq!(&encoded[9..], &SUFFIX_MARKER);
        assert_eq!(parse_builder_codes(&encoded), vec!["abc", "def"]);
    }

    #[test]
    fn test_encode_schema1_layout_is_bit_exact() {
        let registry = Address::repeat_byte(0xaa);
        let suffix = AttributionSuffix {
            schema: SuffixSchema::CustomRegistry {
                chain_id: Bytes::from(vec![0x01, 0x4a, 0x34]),
                registry,
            },
            codes: vec!["q".to_string()],
        };
        let encoded = encode_suffix(&suffix).unwrap();
        assert_eq!(encoded[0], b'q');
        assert_eq!(encoded[1], 1);
        assert_eq!(&encoded[2..5], &[0x01, 0x4a, 0x34]);
        assert_eq!(encoded[5], 3);
        assert_eq!(&encoded[6..26], registry.as_slice());
        assert_eq!(encoded[26], SCHEMA_CUSTOM_REGISTRY);
        assert_eq!(&encoded[27..], &SUFFIX_MARKER);
    }

    #[test]
    fn test_encode_rejects_invalid_codes() {
        let encode = |codes: Vec<&str>| {
            encode_suffix(&AttributionSuffix {
                schema: SuffixSchema::Canonical,
                codes: codes.into_iter().map(String::from).collect(),
            })
        };
        assert_eq!(encode(vec![]), Err(EncodeError::NoCodes));
        assert_eq!(encode(vec![""]), Err(EncodeError::EmptyCode));
        assert!(matches!(encode(vec!["a,b"]), Err(EncodeError::CodeContainsSeparator(_))));
        assert!(matches!(encode(vec!["café"]), Err(EncodeError::NonAsciiCode(_))));
    }

    #[test]
    fn test_encode_rejects_oversized_codes_region() {
        let long = "a".repeat(200);
        let result = encode_suffix(&AttributionSuffix {
            schema: SuffixSchema::Canonical,
            codes: vec![long.clone(), long],
        });
        assert_eq!(result, Err(EncodeError::CodesTooLong(401)));
    }

    #[test]
    fn test_encode_accepts_maximum_length() {
        let code = "z".repeat(MAX_CODES_LENGTH);
        let data = append_suffix(&[], &[code.as_str()]).unwrap();
        assert_eq!(parse_builder_codes(&data), vec![code]);
    }

    #[test]
    fn test_append_suffix_keeps_calldata_prefix() {
        let calldata = hex_to_bytes("0xa9059cbb").unwrap();
        let tagged = append_suffix(&calldata, &["builderscan"]).unwrap();
        assert!(tagged.starts_with(&calldata));
        assert_eq!(parse_builder_codes(&tagged), vec!["builderscan"]);
    }

    // ==================== hex_to_bytes tests ====================

    #[test]
    fn test_hex_to_bytes_with_and_without_prefix() {
        assert_eq!(hex_to_bytes("0x8021").unwrap(), vec![0x80, 0x21]);
        assert_eq!(hex_to_bytes("8021").unwrap(), vec![0x80, 0x21]);
    }

    #[test]
    fn test_hex_to_bytes_invalid() {
        assert!(hex_to_bytes("0xGGGG").is_err());
    }
}
