/// CCITT polynomial (x^8 + x^2 + x + 1) in bit-reflected form
const POLY_REFLECTED: u8 = 0xE0;

/// Feeds a single byte into a running CRC-8
pub const fn crc8_update(crc: u8, byte: u8) -> u8 {
    let mut crc = crc ^ byte;
    let mut bit = 0;
    while bit < 8 {
        crc = if crc & 1 != 0 {
            (crc >> 1) ^ POLY_REFLECTED
        } else {
            crc >> 1
        };
        bit += 1;
    }
    crc
}

/// Computes the frame checksum over `buf`, starting from zero
pub fn crc8(buf: &[u8]) -> u8 {
    buf.iter().fold(0, |crc, b| crc8_update(crc, *b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn known_payloads() {
        assert_eq!(crc8(b"S0"), 0xd2);
        assert_eq!(crc8(b"T1"), 0x81);
        assert_eq!(crc8(b"Wb 1e"), 0xc9);
        assert_eq!(crc8(b"S0 A3"), 0xec);
        assert_eq!(crc8(b"123456789"), 0x20);
    }

    #[test]
    fn incremental_matches_bulk() {
        let data = b"X0 F0";
        let mut crc = 0;
        for b in data {
            crc = crc8_update(crc, *b);
        }
        assert_eq!(crc, crc8(data));
    }
}
