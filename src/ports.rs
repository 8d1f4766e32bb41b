use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Parse a port specification into a deduplicated list of TCP ports (1..=65535).
///
/// Entries are separated by commas or newlines:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comments: everything after `#` on a line is ignored
/// - whitespace and blank entries are ignored
///
/// Order of first appearance is preserved.
pub fn parse_port_spec(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().unwrap_or("");

        for (pos, entry) in line.split(',').map(str::trim).enumerate() {
            if entry.is_empty() {
                continue;
            }
            let at = format!("line {line_no}, entry {}", pos + 1);

            if let Some((a, b)) = entry.split_once('-') {
                let start = parse_port(a.trim())
                    .with_context(|| format!("{at}: invalid start of range {entry}"))?;
                let end = parse_port(b.trim())
                    .with_context(|| format!("{at}: invalid end of range {entry}"))?;
                if start > end {
                    bail!("{at}: invalid range {start}-{end} (start > end)");
                }
                for p in start..=end {
                    if seen.insert(p) {
                        out.push(p);
                    }
                }
                continue;
            }

            let p = parse_port(entry).with_context(|| format!("{at}: invalid port"))?;
            if seen.insert(p) {
                out.push(p);
            }
        }
    }

    Ok(out)
}

/// [`parse_port_spec`] over the contents of a file; errors name the file.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read ports file: {}", path.display()))?;
    parse_port_spec(&content).with_context(|| format!("in ports file: {}", path.display()))
}

fn parse_port(s: &str) -> Result<u16> {
    match s.parse::<u16>() {
        Ok(0) => bail!("port 0 is not scannable"),
        Ok(port) => Ok(port),
        Err(e) => bail!("{s:?} is not a port in 1-65535: {e}"),
    }
}
