// Stream naming for the archive container

/// Reserved catalog stream names
pub const STREAM_HEADER: &str = "header";
pub const STREAM_PARAMS: &str = "params";
pub const STREAM_SAMPLES: &str = "samples";
pub const STREAM_CONTIGS: &str = "contigs";
pub const STREAM_GROUPS: &str = "groups";
pub const STREAM_FALLBACK: &str = "fallback";

/// Compact base64-ish rendering for group ids in stream names.
/// Digits: 0-9 A-Z a-z _ #
pub fn int_to_base64(mut n: u32) -> String {
    const DIGITS: &[u8; 64] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz_#";
    let mut out = String::new();
    loop {
        out.push(DIGITS[(n & 0x3f) as usize] as char);
        n >>= 6;
        if n == 0 {
            break;
        }
    }
    out
}

/// Stream holding a group's raw canonical reference
pub fn group_ref_stream(group_id: u32) -> String {
    format!("g{}r", int_to_base64(group_id))
}

/// Stream holding a group's packed delta segments
pub fn group_delta_stream(group_id: u32) -> String {
    format!("g{}d", int_to_base64(group_id))
}
