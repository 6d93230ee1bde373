// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Surgical buffer write-back.
//!
//! The renderer produces the full target line list; this module applies the
//! smallest practical set of port edits. Strategy ladder:
//!
//! 1. equal buffers — nothing;
//! 2. mismatch confined to one boundary — a single replace plus one
//!    insert/delete range;
//! 3. small mismatch area — LCS opcode walk, one port call per run;
//! 4. anything bigger than the surgical threshold — wholesale tail
//!    replacement.

use crate::port::EditorPort;

/// Mismatch-area ceiling (in DP cells) for the LCS path.
const SURGICAL_THRESHOLD: usize = 100_000;

/// Applies edits so the port's buffer equals `new_lines`. Returns the lines
/// the buffer held before.
pub fn apply_buffer_edits(port: &mut dyn EditorPort, new_lines: &[String]) -> Vec<String> {
    let old_lines = port.lines();
    if old_lines == new_lines {
        return old_lines;
    }

    // First differing index.
    let mut first_mismatch = old_lines.len().min(new_lines.len());
    let mut boundary_only = true;
    for (idx, (old, new)) in old_lines.iter().zip(new_lines.iter()).enumerate() {
        if old != new {
            first_mismatch = idx;
            boundary_only = false;
            break;
        }
    }

    if boundary_only {
        // One list is a prefix of the other: pure append or truncate.
        if new_lines.len() > old_lines.len() {
            port.insert_lines(first_mismatch, &new_lines[first_mismatch..]);
        } else {
            port.remove_lines(first_mismatch, old_lines.len());
        }
        return old_lines;
    }

    let (new_end, old_end) = mismatch_from_end(new_lines, &old_lines, first_mismatch);

    if first_mismatch == old_end {
        // Lines were inserted after a single changed line.
        port.replace_line(first_mismatch, &new_lines[first_mismatch]);
        port.insert_lines(first_mismatch + 1, &new_lines[first_mismatch + 1..=new_end]);
        return old_lines;
    }
    if first_mismatch == new_end {
        // Lines were deleted after a single changed line.
        port.replace_line(first_mismatch, &new_lines[first_mismatch]);
        port.remove_lines(first_mismatch + 1, old_end + 1);
        return old_lines;
    }

    let area = (old_lines.len() - first_mismatch) * (new_lines.len() - first_mismatch);
    if area > SURGICAL_THRESHOLD {
        port.remove_lines(first_mismatch, old_lines.len());
        port.insert_lines(first_mismatch, &new_lines[first_mismatch..]);
        return old_lines;
    }

    surgical(port, &old_lines, new_lines, first_mismatch);
    old_lines
}

/// Index of the last mismatching line in each list, scanning from the end
/// and never crossing `minimum`.
fn mismatch_from_end(list1: &[String], list2: &[String], minimum: usize) -> (usize, usize) {
    let max_rev = list1.len().min(list2.len()) - minimum - 1;
    let mut rev = 0;
    for (i, (a, b)) in list1.iter().rev().zip(list2.iter().rev()).enumerate() {
        rev = i;
        if a != b || i == max_rev {
            break;
        }
    }
    (list1.len() - rev - 1, list2.len() - rev - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Replace,
    Insert,
    Delete,
}

/// Opcode walk over the mismatching suffixes.
fn surgical(port: &mut dyn EditorPort, old: &[String], new: &[String], from: usize) {
    let ops = opcodes(&old[from..], &new[from..]);
    let mut offset: isize = 0;
    for (op, old_range, new_range) in ops {
        let (o1, o2) = (old_range.0 + from, old_range.1 + from);
        let (n1, n2) = (new_range.0 + from, new_range.1 + from);
        let base = offset_index(o1, offset);
        match op {
            Op::Equal => {}
            Op::Replace => {
                let old_count = o2 - o1;
                let new_count = n2 - n1;
                let common = old_count.min(new_count);
                for k in 0..common {
                    port.replace_line(base + k, &new[n1 + k]);
                }
                if new_count > old_count {
                    port.insert_lines(base + common, &new[n1 + common..n2]);
                } else if new_count < old_count {
                    port.remove_lines(base + common, offset_index(o2, offset));
                }
                offset += new_count as isize - old_count as isize;
            }
            Op::Insert => {
                port.insert_lines(base, &new[n1..n2]);
                offset += (n2 - n1) as isize;
            }
            Op::Delete => {
                port.remove_lines(base, offset_index(o2, offset));
                offset -= (o2 - o1) as isize;
            }
        }
    }
}

fn offset_index(index: usize, offset: isize) -> usize {
    usize::try_from(index as isize + offset).unwrap_or(0)
}

/// Classic LCS opcode computation over two slices, returning runs of
/// (op, old range, new range) in order.
fn opcodes(old: &[String], new: &[String]) -> Vec<(Op, (usize, usize), (usize, usize))> {
    let (m, n) = (old.len(), new.len());
    // lcs[i][j] = LCS length of old[i..] and new[j..], flattened.
    let width = n + 1;
    let mut lcs = vec![0u32; (m + 1) * width];
    for i in (0..m).rev() {
        for j in (0..n).rev() {
            lcs[i * width + j] = if old[i] == new[j] {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    // Walk the table, coalescing per-line steps into runs.
    let mut raw: Vec<(Op, usize, usize)> = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < m && j < n {
        if old[i] == new[j] {
            raw.push((Op::Equal, i, j));
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * width + j] >= lcs[i * width + j + 1] {
            raw.push((Op::Delete, i, j));
            i += 1;
        } else {
            raw.push((Op::Insert, i, j));
            j += 1;
        }
    }
    while i < m {
        raw.push((Op::Delete, i, j));
        i += 1;
    }
    while j < n {
        raw.push((Op::Insert, i, j));
        j += 1;
    }

    coalesce(&raw)
}

/// Groups unit steps into ranged opcodes, fusing adjacent delete+insert
/// pairs into replacements.
fn coalesce(raw: &[(Op, usize, usize)]) -> Vec<(Op, (usize, usize), (usize, usize))> {
    let mut runs: Vec<(Op, (usize, usize), (usize, usize))> = Vec::new();
    for &(op, i, j) in raw {
        let (di, dj) = match op {
            Op::Equal => (1, 1),
            Op::Delete => (1, 0),
            Op::Insert => (0, 1),
            Op::Replace => (1, 1),
        };
        if let Some(last) = runs.last_mut() {
            if last.0 == op && last.1 .1 == i && last.2 .1 == j {
                last.1 .1 = i + di;
                last.2 .1 = j + dj;
                continue;
            }
        }
        runs.push((op, (i, i + di), (j, j + dj)));
    }

    // delete followed by insert at the same point (or vice versa) is a
    // replacement run.
    let mut fused: Vec<(Op, (usize, usize), (usize, usize))> = Vec::new();
    for run in runs {
        if let Some(last) = fused.last_mut() {
            let fusable = matches!(
                (last.0, run.0),
                (Op::Delete, Op::Insert) | (Op::Insert, Op::Delete)
            ) && last.1 .1 == run.1 .0
                && last.2 .1 == run.2 .0;
            if fusable {
                last.0 = Op::Replace;
                last.1 .1 = run.1 .1;
                last.2 .1 = run.2 .1;
                continue;
            }
        }
        fused.push(run);
    }
    fused
}
