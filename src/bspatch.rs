use std::io::Read;

use crate::error::{Error, Result};
use crate::patch_format::Control;
use crate::wire::WireReader;

/// A fully read bsdiff triple stream: the triples up to (not including)
/// the sentinel, then the add-data and extra-data blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchBody {
    pub controls: Vec<Control>,
    pub diff: Vec<u8>,
    pub extra: Vec<u8>,
}

/// Read triples until the `add == -1` sentinel, then both data blocks.
pub fn read_body<R: Read>(wire: &mut WireReader<R>) -> Result<PatchBody> {
    let mut controls = Vec::new();
    loop {
        let control: Control = wire.read_message()?;
        if control.is_sentinel() {
            break;
        }
        if control.add < 0 || control.copy < 0 {
            return Err(Error::corrupt(format!(
                "negative length in control triple {control:?}"
            )));
        }
        controls.push(control);
    }
    let diff: Vec<u8> = wire.read_message()?;
    let extra: Vec<u8> = wire.read_message()?;
    Ok(PatchBody {
        controls,
        diff,
        extra,
    })
}

/// Read a triple stream from `wire` and reconstruct the new buffer.
pub fn apply<R: Read>(old: &[u8], wire: &mut WireReader<R>, new_size: u64) -> Result<Vec<u8>> {
    let body = read_body(wire)?;
    apply_body(old, &body, new_size)
}

/// Reconstruct `new_size` bytes from `old` and an already-read body.
///
/// Every triple is bounds-checked against the declared size, the old
/// buffer and both data blocks. The output must come out at exactly
/// `new_size` bytes with both data blocks fully consumed.
pub fn apply_body(old: &[u8], body: &PatchBody, new_size: u64) -> Result<Vec<u8>> {
    let new_size = usize::try_from(new_size)
        .map_err(|_| Error::corrupt(format!("declared size {new_size} does not fit in memory")))?;
    let mut new = Vec::with_capacity(new_size);
    let mut old_pos: i64 = 0;
    let mut diff_pos = 0usize;
    let mut extra_pos = 0usize;

    for control in &body.controls {
        let add = control.add as usize;
        let copy = control.copy as usize;

        if new.len() + add > new_size {
            return Err(Error::corrupt(format!(
                "add of {add} bytes overruns declared size {new_size} at {}",
                new.len()
            )));
        }
        let diff = body
            .diff
            .get(diff_pos..diff_pos + add)
            .ok_or_else(|| Error::corrupt("add-data exhausted"))?;
        let old_slice = usize::try_from(old_pos)
            .ok()
            .and_then(|start| old.get(start..start.checked_add(add)?))
            .ok_or_else(|| {
                Error::corrupt(format!("old cursor {old_pos}+{add} outside old buffer"))
            })?;
        new.extend(diff.iter().zip(old_slice).map(|(d, o)| d.wrapping_add(*o)));
        diff_pos += add;
        old_pos += control.add;

        if new.len() + copy > new_size {
            return Err(Error::corrupt(format!(
                "copy of {copy} bytes overruns declared size {new_size} at {}",
                new.len()
            )));
        }
        let extra = body
            .extra
            .get(extra_pos..extra_pos + copy)
            .ok_or_else(|| Error::corrupt("extra-data exhausted"))?;
        new.extend_from_slice(extra);
        extra_pos += copy;
        old_pos = old_pos
            .checked_add(control.seek)
            .ok_or_else(|| Error::corrupt("old cursor overflow"))?;
    }

    if new.len() != new_size {
        return Err(Error::corrupt(format!(
            "patch produced {} bytes, expected {new_size}",
            new.len()
        )));
    }
    if diff_pos != body.diff.len() || extra_pos != body.extra.len() {
        return Err(Error::corrupt("unconsumed add-data or extra-data"));
    }
    Ok(new)
}
