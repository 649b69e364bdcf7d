// Netascii line-ending transcoding (RFC 764 as referenced by RFC 1350).
//
// On the wire, netascii normalizes every line ending to CR LF and escapes a
// bare CR as CR NUL so the two cases can be told apart on the way back.

/// Encodes raw bytes into netascii: LF becomes CR LF, a bare CR becomes
/// CR NUL, and every other byte passes through unchanged.
pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    for &b in input {
        match b {
            b'\n' => out.extend_from_slice(b"\r\n"),
            b'\r' => out.extend_from_slice(b"\r\0"),
            _ => out.push(b),
        }
    }
    out
}

/// Decodes netascii back into raw bytes: CR LF collapses to LF, CR NUL
/// collapses to CR, anything else passes through.
///
/// Single left-to-right pass with one byte of lookahead. A CR as the final
/// byte of the buffer has no lookahead and passes through as-is, as does a
/// CR followed by anything other than LF or NUL.
pub fn decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'\r' && i + 1 < input.len() {
            match input[i + 1] {
                b'\n' => {
                    out.push(b'\n');
                    i += 2;
                    continue;
                }
                0 => {
                    out.push(b'\r');
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }
        out.push(input[i]);
        i += 1;
    }
    out
}
