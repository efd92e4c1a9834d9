use anyhow::{anyhow, bail, Result};
use reed_solomon_erasure::galois_8::ReedSolomon;

/// Systematic Reed-Solomon code with `k` data fragments and one parity fragment.
pub struct ErasureCodec {
    rs: ReedSolomon,
    data_shards: usize,
}

impl ErasureCodec {
    pub fn new(data_shards: usize) -> Result<Self> {
        let rs = ReedSolomon::new(data_shards, 1)
            .map_err(|err| anyhow!("creating codec with {data_shards} data shards: {err:?}"))?;
        Ok(Self { rs, data_shards })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + 1
    }

    pub fn fragment_len(&self, payload_len: usize) -> usize {
        payload_len.div_ceil(self.data_shards).max(1)
    }

    /// Splits `payload` into zero-padded data fragments followed by the parity fragment.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        let len = self.fragment_len(payload.len());
        let mut fragments: Vec<Vec<u8>> = payload
            .chunks(len)
            .map(|c| {
                let mut f = c.to_vec();
                f.resize(len, 0);
                f
            })
            .collect();
        fragments.resize(self.total_shards(), vec![0; len]);
        self.rs
            .encode(&mut fragments)
            .map_err(|err| anyhow!("computing parity: {err:?}"))?;
        Ok(fragments)
    }

    /// Rebuilds the payload from whatever fragments are present. Needs at least `k` of them.
    pub fn decode(&self, mut fragments: Vec<Option<Vec<u8>>>, payload_len: usize) -> Result<Vec<u8>> {
        if fragments.len() != self.total_shards() {
            bail!(
                "expected {} fragments, got {}",
                self.total_shards(),
                fragments.len()
            );
        }
        self.rs
            .reconstruct_data(&mut fragments)
            .map_err(|err| anyhow!("reconstructing payload: {err:?}"))?;

        let mut payload = Vec::with_capacity(payload_len);
        for f in fragments.into_iter().take(self.data_shards).flatten() {
            payload.extend_from_slice(&f);
        }
        if payload.len() < payload_len {
            bail!("reconstructed {} bytes, want {payload_len}", payload.len());
        }
        payload.truncate(payload_len);
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;

    use super::*;

    #[test]
    fn test_any_k_of_k_plus_one() {
        for k in [1, 2, 3, 5] {
            let codec = ErasureCodec::new(k).unwrap();
            for len in [0, 1, 17, 4096, 10_001] {
                let mut payload = vec![0u8; len];
                rand::rng().fill_bytes(&mut payload);
                let fragments = codec.encode(&payload).unwrap();
                assert_eq!(fragments.len(), k + 1);
                assert!(fragments.iter().all(|f| f.len() == codec.fragment_len(len)));

                for lost in 0..=k {
                    let partial = fragments
                        .iter()
                        .enumerate()
                        .map(|(i, f)| (i != lost).then(|| f.clone()))
                        .collect();
                    assert_eq!(codec.decode(partial, len).unwrap(), payload, "k={k} len={len} lost={lost}");
                }
            }
        }
    }

    #[test]
    fn test_two_missing_fragments() {
        let codec = ErasureCodec::new(2).unwrap();
        let fragments = codec.encode(b"chlos chlos chlos").unwrap();
        let partial = vec![Some(fragments[0].clone()), None, None];
        assert!(codec.decode(partial, 17).is_err());
    }

    #[test]
    fn test_wrong_fragment_count() {
        let codec = ErasureCodec::new(2).unwrap();
        assert!(codec.decode(vec![None, None], 4).is_err());
    }

    #[test]
    fn test_no_data_shards() {
        assert!(ErasureCodec::new(0).is_err());
    }
}
