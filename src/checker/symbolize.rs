/*!
 * One-Shot Symbolization
 * Turns stack addresses into names through an external helper
 *
 * The helper reads hex addresses on stdin, one per line, and writes one
 * symbol name per line in the same order. Spawning it allocates in ways
 * the hooks cannot see, so monitoring shuts down permanently first and
 * the helper runs at most once per process.
 */

use crate::core::errors::{TraceError, TraceResult};
use crate::core::types::Address;
use crate::hooks;
use crate::table::LeakEntry;
use ahash::AHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};

static SYMBOLIZER_RAN: AtomicBool = AtomicBool::new(false);

/// Fill `symbols` on every entry, or leave them empty on failure
pub(crate) fn symbolize_entries(entries: &mut [LeakEntry], program: &Path) -> TraceResult<()> {
    if SYMBOLIZER_RAN.swap(true, Ordering::AcqRel) {
        return Err(TraceError::SymbolizerUnavailable(
            "symbolizer already ran once in this process".into(),
        ));
    }
    // The helper's own allocations are invisible to the hooks; the
    // table would drift, so recording stops for good.
    hooks::disable_monitoring();

    let mut addresses: Vec<Address> = Vec::new();
    let mut seen: AHashMap<Address, usize> = AHashMap::new();
    for entry in entries.iter() {
        for &frame in &entry.stack {
            seen.entry(frame).or_insert_with(|| {
                addresses.push(frame);
                addresses.len() - 1
            });
        }
    }
    if addresses.is_empty() {
        return Ok(());
    }

    let names = run_symbolizer(program, &addresses)?;
    for entry in entries.iter_mut() {
        entry.symbols = entry
            .stack
            .iter()
            .map(|frame| names[seen[frame]].clone())
            .collect();
    }
    Ok(())
}

/// Run the helper once over `addresses`; one name per address, in order
fn run_symbolizer(program: &Path, addresses: &[Address]) -> TraceResult<Vec<String>> {
    let mut child = Command::new(program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| {
            TraceError::SymbolizerUnavailable(format!("{}: {e}", program.display()))
        })?;

    // Taking stdin out of the child lets dropping it close the pipe so
    // the helper sees end of input.
    {
        let mut stdin = child.stdin.take().ok_or_else(|| {
            TraceError::SymbolizerUnavailable("child stdin not captured".into())
        })?;
        for addr in addresses {
            // A helper that exits early closes the pipe; the length
            // check below turns that into a protocol error.
            if writeln!(stdin, "{addr:#018x}").is_err() {
                break;
            }
        }
    }

    let stdout = child.stdout.take().ok_or_else(|| {
        TraceError::SymbolizerUnavailable("child stdout not captured".into())
    })?;
    let mut names = Vec::with_capacity(addresses.len());
    for line in BufReader::new(stdout).lines() {
        let line = line.map_err(|e| {
            TraceError::SymbolizerUnavailable(format!("read from symbolizer: {e}"))
        })?;
        names.push(line);
    }
    let _ = child.wait();

    if names.len() != addresses.len() {
        return Err(TraceError::SymbolizerProtocol {
            written: addresses.len(),
            read: names.len(),
        });
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    // run_symbolizer has no global side effects, so it is testable
    // without tripping the once-only gate.

    #[test]
    fn cat_echoes_addresses_back() {
        let names = run_symbolizer(Path::new("/bin/cat"), &[0x1000, 0xdeadbeef]).unwrap();
        assert_eq!(names, vec!["0x0000000000001000", "0x00000000deadbeef"]);
    }

    #[test]
    fn missing_helper_is_unavailable() {
        let err = run_symbolizer(&PathBuf::from("/nonexistent/sym"), &[0x1]).unwrap_err();
        assert!(matches!(err, TraceError::SymbolizerUnavailable(_)));
    }

    #[test]
    fn short_output_is_a_protocol_error() {
        // true(1) reads nothing and prints nothing
        let err = run_symbolizer(Path::new("/bin/true"), &[0x1, 0x2]).unwrap_err();
        assert!(matches!(
            err,
            TraceError::SymbolizerProtocol { written: 2, read: 0 }
        ));
    }
}
