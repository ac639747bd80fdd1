//! Path canonicalization.
//!
//! Lexically simplifies paths like "foo/./bar" => "foo/bar" without touching
//! the disk.  These paths show up due to variable expansion in particular.
//!
//! On Windows, backslashes count as separators and are rewritten to forward
//! slashes; which separators were originally backslashes is returned as a
//! bitmask (lowest bit = first separator of the canonical output) so the
//! original spelling can be reconstructed when the path is handed back to
//! tools that care.

use anyhow::bail;

/// Upper bound on path components, which also bounds the slash mask.
const MAX_COMPONENTS: usize = 60;

/// One stack slot per component: where it starts in the output buffer and
/// how many separators preceded it.
#[derive(Clone, Copy)]
struct Component {
    dst: usize,
    seps: u32,
}

fn is_sep(c: u8, backslashes: bool) -> bool {
    c == b'/' || (backslashes && c == b'\\')
}

/// Canonicalize `path` in place (the buffer can only shrink) and return the
/// backslash mask.  `backslashes` selects whether '\\' acts as a separator.
fn canonicalize_impl(path: &mut String, backslashes: bool) -> anyhow::Result<u64> {
    if path.is_empty() {
        bail!("empty path");
    }
    // Safety: only ASCII separator bytes are rewritten and whole components
    // are copied, so the buffer stays valid UTF-8.
    let buf = unsafe { path.as_mut_vec() };
    let end = buf.len();

    let mut components = [Component { dst: 0, seps: 0 }; MAX_COMPONENTS];
    let mut component_count = 0;

    let mut bits: u64 = 0;
    let mut seps: u32 = 0;
    let mut dst = 0;
    let mut src = 0;

    // One closure for every separator we emit, so the mask stays in sync
    // with the output buffer.
    macro_rules! put_sep {
        ($orig:expr) => {{
            if seps as usize >= MAX_COMPONENTS {
                bail!("too many path components");
            }
            if $orig == b'\\' {
                bits |= 1 << seps;
            }
            buf[dst] = b'/';
            dst += 1;
            seps += 1;
        }};
    }

    if is_sep(buf[src], backslashes) {
        let c = buf[src];
        src += 1;
        put_sep!(c);
    }

    // Outer loop: one iteration per path component.
    while src < end {
        match buf[src] {
            c if is_sep(c, backslashes) => {
                // Redundant separator ("//"), drop it.
                src += 1;
                continue;
            }
            b'.' => {
                let mut peek = src + 1;
                if peek == end {
                    break; // Trailing '.', trim.
                }
                if is_sep(buf[peek], backslashes) {
                    // "./", skip.
                    src += 2;
                    continue;
                }
                if buf[peek] == b'.' {
                    peek += 1;
                    if peek == end || is_sep(buf[peek], backslashes) {
                        // ".." component, try to back up.
                        if component_count > 0 {
                            component_count -= 1;
                            let c = components[component_count];
                            dst = c.dst;
                            seps = c.seps;
                            bits &= (1u64 << seps) - 1;
                        } else {
                            buf[dst] = b'.';
                            buf[dst + 1] = b'.';
                            dst += 2;
                            if peek != end {
                                put_sep!(buf[peek]);
                            }
                        }
                        src = peek + 1;
                        continue;
                    }
                    // A component that merely starts with "..": ordinary.
                }
            }
            _ => {}
        }

        // Mark this point as a possible target to pop to.
        if component_count == MAX_COMPONENTS {
            bail!("too many path components");
        }
        components[component_count] = Component { dst, seps };
        component_count += 1;

        // Inner loop: copy one path component, including the trailing
        // separator.
        while src < end {
            let c = buf[src];
            src += 1;
            if is_sep(c, backslashes) {
                put_sep!(c);
                break;
            }
            buf[dst] = c;
            dst += 1;
        }
    }

    if dst == 0 {
        buf.clear();
        buf.push(b'.');
    } else {
        buf.truncate(dst);
    }
    Ok(bits)
}

/// Canonicalize a path in place using the host platform's separator rules.
pub fn canonicalize_in_place(path: &mut String) -> anyhow::Result<u64> {
    canonicalize_impl(path, cfg!(windows))
}

#[must_use = "this method returns the canonicalized copy; prefer canonicalize_in_place"]
pub fn canonicalize(path: impl Into<String>) -> anyhow::Result<(String, u64)> {
    let mut path = path.into();
    let bits = canonicalize_in_place(&mut path)?;
    Ok((path, bits))
}
