//! Name fingerprints used as label values.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a of `name` as 8 lowercase hex characters.
///
/// Names can exceed the label value length limit, so labels carry this
/// fingerprint instead. Not collision-resistant.
pub fn name_hash(name: &str) -> String {
    let hash = name
        .bytes()
        .fold(FNV_OFFSET_BASIS, |hash, byte| {
            (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
        });
    format!("{hash:08x}")
}
