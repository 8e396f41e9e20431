//! Article fixtures and yEnc content generators

/// Group every fixture article is posted to
pub const TEST_GROUP: &str = "alt.binaries.test";

/// Test content for plain text articles
pub const TEST_ARTICLE_CONTENT: &[u8] = b"This is test content for usenet-engine integration tests.\r\n\
    Line 2 of the test content.\r\n\
    Line 3 with some special chars: !@#$%^&*()\r\n";

/// Deterministic binary payload covering every byte value
pub fn test_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

/// Encode one yEnc line body, escaping the critical characters
fn encode_into(out: &mut Vec<u8>, data: &[u8], line_len: usize) {
    let mut col = 0;
    for &byte in data {
        let encoded = byte.wrapping_add(42);
        // whitespace is always escaped so trimming decoders keep it
        let escape = matches!(encoded, 0x00 | 0x09 | 0x0A | 0x0D | 0x20 | 0x3D)
            || (col == 0 && encoded == 0x2E);
        if escape {
            out.push(b'=');
            out.push(encoded.wrapping_add(64));
            col += 2;
        } else {
            out.push(encoded);
            col += 1;
        }
        if col >= line_len {
            out.extend_from_slice(b"\r\n");
            col = 0;
        }
    }
    if col > 0 {
        out.extend_from_slice(b"\r\n");
    }
}

/// Generate a single-part yEnc body
pub fn generate_yenc_content(data: &[u8], filename: &str) -> Vec<u8> {
    let mut result = Vec::new();
    let header = format!("=ybegin line=128 size={} name={}\r\n", data.len(), filename);
    result.extend_from_slice(header.as_bytes());
    encode_into(&mut result, data, 128);
    let footer = format!("=yend size={}\r\n", data.len());
    result.extend_from_slice(footer.as_bytes());
    result
}

/// Generate one part of a multi-part yEnc file
///
/// `begin` is the 0-based offset of `data` inside the whole file.
pub fn generate_yenc_part(
    data: &[u8],
    filename: &str,
    file_size: usize,
    part: usize,
    total_parts: usize,
    begin: usize,
) -> Vec<u8> {
    let mut result = Vec::new();
    let header = format!(
        "=ybegin part={part} total={total_parts} line=128 size={file_size} name={filename}\r\n=ypart begin={} end={}\r\n",
        begin + 1,
        begin + data.len()
    );
    result.extend_from_slice(header.as_bytes());
    encode_into(&mut result, data, 128);
    let footer = format!("=yend size={} part={part}\r\n", data.len());
    result.extend_from_slice(footer.as_bytes());
    result
}

/// Split `data` into `parts` yEnc articles named `<stem>.partN@test`
///
/// Returns the message ids in order and the bodies keyed by message id.
pub fn yenc_articles(
    stem: &str,
    filename: &str,
    data: &[u8],
    parts: usize,
) -> (Vec<String>, Vec<(String, Vec<u8>)>) {
    let chunk = data.len().div_ceil(parts);
    let mut ids = Vec::new();
    let mut bodies = Vec::new();
    for (i, piece) in data.chunks(chunk).enumerate() {
        let id = format!("{stem}.part{}@test", i + 1);
        let body = generate_yenc_part(piece, filename, data.len(), i + 1, parts, i * chunk);
        ids.push(id.clone());
        bodies.push((id, body));
    }
    (ids, bodies)
}
