//! Batch file payload format: a length-delimited sequence of `TickRecord`
//! protobuf messages.

use anyhow::Context as _;
use bytes::Buf;
use common::types::TickRecord;
use prost::Message as _;

pub fn encode_batch(ticks: &[TickRecord]) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    for tick in ticks {
        tick.encode_length_delimited(&mut buf)?;
    }
    Ok(buf)
}

pub fn decode_batch(mut buf: &[u8]) -> anyhow::Result<Vec<TickRecord>> {
    let mut ticks = Vec::new();
    while buf.has_remaining() {
        let tick = TickRecord::decode_length_delimited(&mut buf)
            .with_context(|| format!("corrupt tick record after {} records", ticks.len()))?;
        ticks.push(tick);
    }
    Ok(ticks)
}

#[cfg(test)]
mod tests {
    use common::types::TickRecord;

    use super::{
        decode_batch,
        encode_batch,
    };

    #[test]
    fn test_decode_rejects_truncated_payload() -> anyhow::Result<()> {
        let ticks: Vec<_> = (0..4)
            .map(|n| TickRecord {
                tick_number: n * 10,
                payload: vec![0xab; 32],
            })
            .collect();
        let encoded = encode_batch(&ticks)?;
        assert_eq!(decode_batch(&encoded)?, ticks);

        let truncated = &encoded[..encoded.len() - 7];
        assert!(decode_batch(truncated).is_err());
        Ok(())
    }
}
