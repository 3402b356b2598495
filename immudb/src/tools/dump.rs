//! Human-readable listing of the data log.

use std::io::Write;

use crate::storage::address::Address;
use crate::storage::commit::{CommitType, DataRecord};
use crate::storage::mmap::Storage;
use crate::storage::processor::{CommitHandler, LogSummary, process_log};
use crate::storage::record::Record;
use crate::tools::ToolError;

struct Dumper<'a, W> {
    out: &'a mut W,
}

impl<W: Write> CommitHandler for Dumper<'_, W> {
    type Error = ToolError;

    fn on_timestamp(&mut self, commit: Address, timestamp: u32) -> Result<(), ToolError> {
        write!(self.out, "{commit} ts={timestamp}")?;
        Ok(())
    }

    fn on_type(&mut self, kind: CommitType) -> Result<(), ToolError> {
        writeln!(self.out, " type={}", char::from(kind.tag()))?;
        Ok(())
    }

    fn on_add(&mut self, adr: Address, rec: DataRecord) -> Result<(), ToolError> {
        writeln!(
            self.out,
            "  add    {adr} table={} {}",
            rec.tblnum,
            show(&rec.record)
        )?;
        Ok(())
    }

    fn on_update(
        &mut self,
        from_adr: Address,
        _: DataRecord,
        to_adr: Address,
        to: DataRecord,
    ) -> Result<(), ToolError> {
        writeln!(
            self.out,
            "  update {from_adr} -> {to_adr} table={} {}",
            to.tblnum,
            show(&to.record)
        )?;
        Ok(())
    }

    fn on_remove(&mut self, adr: Address, rec: DataRecord) -> Result<(), ToolError> {
        writeln!(self.out, "  remove {adr} table={}", rec.tblnum)?;
        Ok(())
    }

    fn on_after(&mut self, _: Address, size: u32) -> Result<(), ToolError> {
        writeln!(self.out, "  end size={size}")?;
        Ok(())
    }
}

/// Fields as text where printable, hex otherwise.
fn show(rec: &Record) -> String {
    let fields: Vec<String> = rec
        .fields()
        .map(|f| match std::str::from_utf8(f) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => format!("{s:?}"),
            _ => f.iter().map(|b| format!("{b:02x}")).collect(),
        })
        .collect();
    format!("[{}]", fields.join(", "))
}

/// Write every committed segment of `stor` to `out`.
pub fn dump<W: Write>(stor: &Storage, out: &mut W) -> Result<LogSummary, ToolError> {
    let summary = process_log(stor, 0, stor.end(), &mut Dumper { out: &mut *out })?;
    writeln!(
        out,
        "{} committed, {} aborted, {} of {} bytes valid{}",
        summary.committed,
        summary.aborted,
        summary.end,
        stor.end(),
        if summary.truncated { ", torn tail" } else { "" }
    )?;
    Ok(summary)
}
