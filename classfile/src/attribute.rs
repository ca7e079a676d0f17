use crate::cursor::Cursor;
use crate::{ClassFileError, Result};

/// Skips an attribute whose name the caller does not recognize. The declared
/// length must fit in the remaining input or the file is malformed.
pub fn skip_attribute(cur: &mut Cursor<'_>, name: &str) -> Result<()> {
    let length = cur.read_u32()? as usize;
    if cur.remaining() < length {
        return Err(ClassFileError::AttributeLengthMismatch(name.to_string()));
    }
    cur.skip(length)
}

/// Reads an attribute body with `read` and verifies the consumed byte count
/// matches the declared attribute length.
pub fn read_checked<T>(
    cur: &mut Cursor<'_>,
    name: &'static str,
    read: impl FnOnce(&mut Cursor<'_>) -> Result<T>,
) -> Result<T> {
    let length = cur.read_u32()? as usize;
    let start = cur.position();
    let value = read(cur)?;
    if cur.position() - start != length {
        return Err(ClassFileError::AttributeLengthMismatch(name.to_string()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_validates_length() {
        let data = [0u8, 0, 0, 9, 1, 2]; // claims 9 bytes, only 2 present
        let mut cur = Cursor::new(&data);
        assert!(skip_attribute(&mut cur, "Whatever").is_err());
    }

    #[test]
    fn read_checked_detects_short_reads() {
        let data = [0u8, 0, 0, 4, 0, 7, 0, 0];
        let mut cur = Cursor::new(&data);
        let res = read_checked(&mut cur, "Thing", |c| c.read_u16());
        assert!(matches!(res, Err(ClassFileError::AttributeLengthMismatch(_))));
    }
}
