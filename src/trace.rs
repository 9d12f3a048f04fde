/*!
Embedding-trace loader.

Line format (whitespace separated, blank lines delimit pooling batches):

```text
<TARGET> <CMD> <ADDR_DEC> <VEC_CLASS> <SUBVEC_IDX> [<VLEN>] [<BATCH_TAG>]
```

- `TARGET`: `HBM` (PIM-capable memory) or `DIMM` (commodity memory).
- `CMD`: `RD`, `RDD`, `PR` (prefetch broadcast), `TR` (transfer), `DR`
  (deliver).
- `VEC_CLASS`: `q`/`r`/`h`/`o`.
- `VLEN` defaults to 1; `BATCH_TAG` defaults to 0.

Malformed lines are logged and skipped; they never abort a run. Under
CA-compression only the `subvec_idx == vlen - 1` HBM entries are admitted:
each surviving entry stands for `vlen` adjacent sub-vector reads that the
memory side decompresses again.
*/

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::warn;

use crate::error::SimError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Hbm,
    Dimm,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TraceOp {
    Read,
    ReadDup,
    PrefetchBroadcast,
    Transfer,
    Deliver,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VecClass {
    Query,
    Reference,
    Hot,
    Other,
}

#[derive(Copy, Clone, Debug)]
pub struct TraceEntry {
    pub target: Target,
    pub op: TraceOp,
    pub addr: u64,
    pub vec_class: VecClass,
    pub subvec_idx: u32,
    pub vlen: u32,
    pub batch_tag: usize,
}

/// One embedding-pooling batch: the HBM-side and DIMM-side accesses between
/// two blank lines.
#[derive(Clone, Debug, Default)]
pub struct Pool {
    pub pim: Vec<TraceEntry>,
    pub mem: Vec<TraceEntry>,
}

fn parse_line(line: &str, line_no: usize) -> Result<TraceEntry, SimError> {
    let parse = |reason: String| SimError::TraceParse {
        line: line_no,
        reason,
    };
    let mut fields = line.split_whitespace();
    let target = match fields.next() {
        Some("HBM") => Target::Hbm,
        Some("DIMM") => Target::Dimm,
        other => return Err(parse(format!("bad target {other:?}"))),
    };
    let op = match fields.next() {
        Some("RD") => TraceOp::Read,
        Some("RDD") => TraceOp::ReadDup,
        Some("PR") => TraceOp::PrefetchBroadcast,
        Some("TR") => TraceOp::Transfer,
        Some("DR") => TraceOp::Deliver,
        other => return Err(parse(format!("bad command {other:?}"))),
    };
    let addr = fields
        .next()
        .ok_or_else(|| parse("missing address".into()))?
        .parse::<u64>()
        .map_err(|e| parse(format!("bad address: {e}")))?;
    let vec_class = match fields.next() {
        Some("q") => VecClass::Query,
        Some("r") => VecClass::Reference,
        Some("h") => VecClass::Hot,
        Some("o") => VecClass::Other,
        other => return Err(parse(format!("bad vector class {other:?}"))),
    };
    let subvec_idx = fields
        .next()
        .ok_or_else(|| parse("missing sub-vector index".into()))?
        .parse::<u32>()
        .map_err(|e| parse(format!("bad sub-vector index: {e}")))?;
    let vlen = match fields.next() {
        Some(text) => text
            .parse::<u32>()
            .map_err(|e| parse(format!("bad vlen: {e}")))?,
        None => 1,
    };
    if !matches!(vlen, 1 | 2 | 4 | 8) {
        return Err(parse(format!("vlen {vlen} is not one of 1/2/4/8")));
    }
    let batch_tag = match fields.next() {
        Some(text) => text
            .parse::<usize>()
            .map_err(|e| parse(format!("bad batch tag: {e}")))?,
        None => 0,
    };
    Ok(TraceEntry {
        target,
        op,
        addr,
        vec_class,
        subvec_idx,
        vlen,
        batch_tag,
    })
}

pub fn load_trace_file(path: &Path, ca_compression: bool) -> Result<Vec<Pool>, SimError> {
    let file = File::open(path)?;
    load_trace(BufReader::new(file), ca_compression)
}

pub fn load_trace<R: BufRead>(reader: R, ca_compression: bool) -> Result<Vec<Pool>, SimError> {
    let mut pools = vec![Pool::default()];
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            if !pools.last().is_some_and(|p| p.pim.is_empty() && p.mem.is_empty()) {
                pools.push(Pool::default());
            }
            continue;
        }
        let entry = match parse_line(&line, line_no + 1) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skipping trace line: {err}");
                continue;
            }
        };
        let pool = pools.last_mut().expect("at least one pool");
        match entry.target {
            Target::Hbm => {
                // Under CA-compression one entry stands for the whole logical
                // vector; admit only the top sub-vector.
                if !ca_compression || entry.subvec_idx == entry.vlen - 1 {
                    pool.pim.push(entry);
                }
            }
            Target::Dimm => pool.mem.push(entry),
        }
    }
    // Drop a trailing empty pool left by a final blank line.
    if pools.len() > 1 && pools.last().is_some_and(|p| p.pim.is_empty() && p.mem.is_empty()) {
        pools.pop();
    }
    Ok(pools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const TRACE: &str = "\
HBM RD 4096 q 0
HBM RD 8192 r 0
DIMM RD 123456 o 0

HBM RD 12288 q 3 4 1
HBM RD 16384 q 0 4 1
DIMM RD 654321 o 0
";

    #[test]
    fn pools_split_on_blank_lines() {
        let pools = load_trace(Cursor::new(TRACE), false).unwrap();
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].pim.len(), 2);
        assert_eq!(pools[0].mem.len(), 1);
        assert_eq!(pools[1].pim.len(), 2);
        assert_eq!(pools[1].mem.len(), 1);
        assert_eq!(pools[0].pim[1].vec_class, VecClass::Reference);
        assert_eq!(pools[1].pim[0].batch_tag, 1);
    }

    #[test]
    fn ca_compression_admits_only_top_subvector() {
        let pools = load_trace(Cursor::new(TRACE), true).unwrap();
        // 4096/8192 have vlen 1, idx 0 -> kept; 12288 has idx 3 == vlen-1 ->
        // kept; 16384 has idx 0 != 3 -> dropped.
        assert_eq!(pools[0].pim.len(), 2);
        assert_eq!(pools[1].pim.len(), 1);
        assert_eq!(pools[1].pim[0].addr, 12288);
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let text = "HBM RD notanumber q 0\nHBM XX 4096 q 0\nHBM RD 4096 z 0\nHBM RD 4096 q 0\n";
        let pools = load_trace(Cursor::new(text), false).unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].pim.len(), 1);
        assert_eq!(pools[0].pim[0].addr, 4096);
    }

    #[test]
    fn vlen_must_be_a_subvector_count() {
        let text = "HBM RD 4096 q 0 3\n";
        let pools = load_trace(Cursor::new(text), false).unwrap();
        assert!(pools[0].pim.is_empty());
    }

    #[test]
    fn consecutive_blank_lines_do_not_make_empty_pools() {
        let text = "HBM RD 4096 q 0\n\n\n\nHBM RD 8192 q 0\n\n";
        let pools = load_trace(Cursor::new(text), false).unwrap();
        assert_eq!(pools.len(), 2);
    }

    #[test]
    fn all_commands_parse() {
        let text = "HBM RD 64 q 0\nHBM RDD 128 q 0\nHBM PR 192 h 0\nHBM TR 256 q 0\nDIMM DR 320 o 0\n";
        let pools = load_trace(Cursor::new(text), false).unwrap();
        let ops: Vec<TraceOp> = pools[0].pim.iter().map(|e| e.op).collect();
        assert_eq!(
            ops,
            vec![
                TraceOp::Read,
                TraceOp::ReadDup,
                TraceOp::PrefetchBroadcast,
                TraceOp::Transfer
            ]
        );
        assert_eq!(pools[0].mem[0].op, TraceOp::Deliver);
    }
}
