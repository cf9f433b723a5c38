use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, CheckBytes, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// Error type for versioned codec operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Data is too short to contain a version header
    TooShort,
    /// Version byte doesn't match expected version
    UnsupportedVersion { expected: u8, found: u8 },
    /// Underlying rkyv serialization/deserialization error
    Rkyv(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::TooShort => write!(f, "data too short to contain version header"),
            CodecError::UnsupportedVersion { expected, found } => {
                write!(
                    f,
                    "unsupported version: expected {}, found {}",
                    expected, found
                )
            }
            CodecError::Rkyv(e) => write!(f, "rkyv error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

// Format versions. Bump and add a migration branch in the decoder when a
// record layout changes.

/// Object envelope (type tag, owner, backup owner, payload)
pub const ENVELOPE_VERSION: u8 = 1;
/// Typed payloads stored inside the envelope
pub const PAYLOAD_VERSION: u8 = 1;

const VERSION_HEADER_SIZE: usize = 1;

#[inline]
fn prepend_version(version: u8, data: AlignedVec) -> Vec<u8> {
    let mut result = Vec::with_capacity(VERSION_HEADER_SIZE + data.len());
    result.push(version);
    result.extend_from_slice(&data);
    result
}

/// Strip and check the version byte. The rest is copied into an `AlignedVec`
/// because rkyv needs aligned input.
#[inline]
fn strip_version(expected: u8, data: &[u8]) -> Result<AlignedVec, CodecError> {
    if data.len() < VERSION_HEADER_SIZE {
        return Err(CodecError::TooShort);
    }
    let found = data[0];
    if found != expected {
        return Err(CodecError::UnsupportedVersion { expected, found });
    }
    let rkyv_data = &data[VERSION_HEADER_SIZE..];
    let mut aligned = AlignedVec::with_capacity(rkyv_data.len());
    aligned.extend_from_slice(rkyv_data);
    Ok(aligned)
}

pub fn encode<T>(version: u8, value: &T) -> Result<Vec<u8>, CodecError>
where
    T: RkyvSerialize<AllocSerializer<256>>,
{
    let data = rkyv::to_bytes::<T, 256>(value).map_err(|e| CodecError::Rkyv(e.to_string()))?;
    Ok(prepend_version(version, data))
}

/// Validate and deserialize into an owned value.
pub fn decode<T>(version: u8, bytes: &[u8]) -> Result<T, CodecError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + RkyvDeserialize<T, rkyv::Infallible>,
{
    let data = strip_version(version, bytes)?;
    let archived =
        rkyv::check_archived_root::<T>(&data).map_err(|e| CodecError::Rkyv(e.to_string()))?;
    let mut des = rkyv::Infallible;
    Ok(RkyvDeserialize::deserialize(archived, &mut des)
        .unwrap_or_else(|_| unreachable!("infallible deserialization")))
}
