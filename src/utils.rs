/// Formats `buffer` sixteen bytes per line, labelling each line with the
/// bus address it was read from starting at `base`.
pub fn hexdump(buffer: &[u8], base: u32) -> String {
    let mut str = String::new();
    for (row, chunk) in buffer.chunks(16).enumerate() {
        let mut line = format!("{:08x}: ", base.wrapping_add(row as u32 * 16));
        let mut chars = String::new();
        for byte in chunk {
            line.push_str(&format!("{:02x} ", byte));
            let c = *byte as char;
            chars.push(if c.is_ascii_graphic() || c == ' ' {
                c
            } else {
                '.'
            });
        }

        let dump_line = format!("{:<58} {}\n", line, chars);
        str.push_str(&dump_line);
    }

    str
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hexdump_labels_rows() {
        let data: Vec<u8> = (0x41..0x41 + 20).collect();
        let dump = hexdump(&data, 0x0600_0000);
        let lines: Vec<&str> = dump.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("06000000: 41 42 43"));
        assert!(lines[0].ends_with("ABCDEFGHIJKLMNOP"));
        assert!(lines[1].starts_with("06000010: 51 52 53 54"));
        assert!(lines[1].ends_with("QRST"));
    }
}
