//! hexdump into a string.
//!
//! Renders a byte buffer as rows of 16 bytes: two hex digits per byte
//! separated by spaces, unused trailing slots as `.. `, a two-space gutter,
//! then a printable column where non-printable bytes show as `.`.

const BYTES_PER_LINE: usize = 16;

pub fn hexify<T: AsRef<[u8]>>(buf: T) -> String {
    let mut out = String::new();

    for row in buf.as_ref().chunks(BYTES_PER_LINE) {
        let mut hexline: Vec<u8> = b".. ".repeat(BYTES_PER_LINE);
        let mut printable = String::with_capacity(BYTES_PER_LINE);

        for (col, &ch) in row.iter().enumerate() {
            const DIGITS: &[u8; 16] = b"0123456789abcdef";
            hexline[col * 3] = DIGITS[(ch >> 4) as usize];
            hexline[col * 3 + 1] = DIGITS[(ch & 0x0f) as usize];

            printable.push(if ch.is_ascii_graphic() || ch == b' ' {
                ch as char
            } else {
                '.'
            });
        }

        // hexline already ends in a space; one more makes the gutter.
        out.push_str(std::str::from_utf8(&hexline).expect("hexline is ascii"));
        out.push(' ');
        out.push_str(&printable);
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::hexify;

    #[test]
    fn empty() {
        assert_eq!(hexify(""), "");
    }

    #[test]
    fn one_char() {
        assert_eq!(
            hexify("a"),
            "61 .. .. .. .. .. .. .. .. .. .. .. .. .. .. ..  a\n"
        );
    }

    #[test]
    fn non_printable() {
        assert_eq!(
            hexify(b"\x01\x02\x03"),
            "01 02 03 .. .. .. .. .. .. .. .. .. .. .. .. ..  ...\n"
        );
    }

    #[test]
    fn full_line() {
        assert_eq!(
            hexify("0123456701234567"),
            "30 31 32 33 34 35 36 37 30 31 32 33 34 35 36 37  0123456701234567\n"
        );
    }

    #[test]
    fn wraps_after_16() {
        assert_eq!(
            hexify("01234567012345670"),
            "30 31 32 33 34 35 36 37 30 31 32 33 34 35 36 37  0123456701234567\n\
             30 .. .. .. .. .. .. .. .. .. .. .. .. .. .. ..  0\n"
        );
    }
}
