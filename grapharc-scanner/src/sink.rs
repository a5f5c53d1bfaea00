use crate::error::Result;
use serde_json::Value;

/// Receives each node record as soon as it is complete.
pub trait RecordSink {
    fn write_record(&mut self, record: &Value) -> Result<()>;

    /// Releases any resources held by the sink.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Collects records in memory.
impl RecordSink for Vec<Value> {
    fn write_record(&mut self, record: &Value) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }
}
