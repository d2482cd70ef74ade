//! ANSI escape sequence stripping

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

/// Strip ANSI escape sequences from a byte slice.
///
/// Handles CSI (`ESC [ ... final`), OSC (`ESC ] ... BEL|ST`), charset
/// selection (`ESC ( X`) and two-byte escapes. Boot menus and `watch` redraw
/// the screen with these, which would otherwise split prompts apart.
///
/// A sequence cut off by the end of `data` is dropped, except for a lone
/// trailing `ESC`.
pub fn strip_ansi(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        if data[i] != ESC {
            out.push(data[i]);
            i += 1;
            continue;
        }

        i = match sequence_end(data, i) {
            Some(end) => end,
            None if i + 1 == data.len() => {
                out.push(ESC);
                data.len()
            }
            None => data.len(),
        };
    }

    out
}

/// Start of an escape sequence that `data` ends in the middle of, or
/// `data.len()` when every sequence is complete.
pub(crate) fn incomplete_tail(data: &[u8]) -> usize {
    let mut i = 0;
    while i < data.len() {
        if data[i] != ESC {
            i += 1;
            continue;
        }
        match sequence_end(data, i) {
            Some(end) => i = end,
            None => return i,
        }
    }
    data.len()
}

/// End of the sequence whose `ESC` is at `data[i]`; `None` if it runs past the data.
fn sequence_end(data: &[u8], i: usize) -> Option<usize> {
    match data.get(i + 1)? {
        // CSI parameters and intermediates end at the first byte in 0x40..=0x7e.
        b'[' => data[i + 2..]
            .iter()
            .position(|ch| (0x40..=0x7e).contains(ch))
            .map(|pos| i + 3 + pos),
        b']' => osc_end(data, i + 2),
        b'(' | b')' => (i + 3 <= data.len()).then_some(i + 3),
        _ => Some(i + 2),
    }
}

fn osc_end(data: &[u8], mut i: usize) -> Option<usize> {
    while i < data.len() {
        if data[i] == BEL {
            return Some(i + 1);
        }
        if data[i] == ESC && data.get(i + 1) == Some(&b'\\') {
            return Some(i + 2);
        }
        i += 1;
    }
    None
}
