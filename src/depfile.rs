//! Parsing of Makefile syntax as found in `.d` files emitted by C compilers.
//! This is the "gcc" flavor of discovered dependencies; the parsed inputs are
//! folded back into the build graph and recorded in the build log.

use crate::{
    scanner::{ParseResult, Scanner},
    smallmap::SmallMap,
};

/// Skip spaces and backslashed newlines.
fn skip_spaces(scanner: &mut Scanner) -> ParseResult<()> {
    loop {
        match scanner.read() {
            b' ' => {}
            b'\\' => match scanner.read() {
                b'\n' => {}
                b'\r' => {
                    if !scanner.skip(b'\n') {
                        return scanner.parse_error("invalid backslash escape");
                    }
                }
                _ => return scanner.parse_error("invalid backslash escape"),
            },
            _ => {
                scanner.back();
                break;
            }
        }
    }
    Ok(())
}

/// Read one path from the input scanner.
/// Note: treats colon as a valid character in a path because of Windows-style
/// paths, which means the initial `output: ...` path will include the
/// trailing colon.
fn read_path<'a>(scanner: &mut Scanner<'a>) -> ParseResult<Option<&'a str>> {
    skip_spaces(scanner)?;
    let start = scanner.ofs;
    loop {
        match scanner.read() {
            b'\0' | b' ' | b'\n' | b'\r' => {
                scanner.back();
                break;
            }
            b'\\' => {
                if scanner.peek() == b'\n' || scanner.peek() == b'\r' {
                    scanner.back();
                    break;
                }
            }
            _ => {}
        }
    }
    let end = scanner.ofs;
    if end == start {
        return Ok(None);
    }
    Ok(Some(scanner.slice(start, end)))
}

/// Parse a `.d` file into a map of target name to dependency list.
pub fn parse<'a>(scanner: &mut Scanner<'a>) -> ParseResult<SmallMap<&'a str, Vec<&'a str>>> {
    let mut result = SmallMap::default();
    loop {
        while matches!(scanner.peek(), b' ' | b'\n' | b'\r') {
            scanner.next();
        }
        let target = match read_path(scanner)? {
            None => break,
            Some(o) => o,
        };
        scanner.skip_spaces();
        let target = match target.strip_suffix(':') {
            None => {
                scanner.expect(b':')?;
                target
            }
            Some(target) => target,
        };
        let mut deps = Vec::new();
        while let Some(p) = read_path(scanner)? {
            deps.push(p);
        }
        result.insert(target, deps);
    }
    scanner.expect(b'\0')?;

    Ok(result)
}
