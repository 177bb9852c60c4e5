use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Admission {
    pub ok: bool,
    pub free_bytes: u64,
}

/// Source of live free-space readings.
pub trait SpaceProbe {
    fn free_bytes(&self) -> std::io::Result<u64>;
}

pub struct FsProbe {
    pub path: PathBuf,
}

impl SpaceProbe for FsProbe {
    fn free_bytes(&self) -> std::io::Result<u64> {
        fs2::available_space(&self.path)
    }
}

/// Stateless admission check: free space must strictly exceed the
/// candidate's size plus the reserve.
pub struct DiskGate<P> {
    probe: P,
    reserve_bytes: u64,
}

impl<P: SpaceProbe> DiskGate<P> {
    pub fn new(probe: P, reserve_bytes: u64) -> Self {
        Self {
            probe,
            reserve_bytes,
        }
    }

    pub fn admit(&self, required_bytes: u64) -> Admission {
        match self.probe.free_bytes() {
            Ok(free_bytes) => Admission {
                ok: fits(free_bytes, required_bytes, self.reserve_bytes),
                free_bytes,
            },
            Err(err) => {
                tracing::error!(%err, "disk: reading free space failed; refusing admission");
                Admission {
                    ok: false,
                    free_bytes: 0,
                }
            }
        }
    }
}

pub fn fits(free_bytes: u64, required_bytes: u64, reserve_bytes: u64) -> bool {
    free_bytes > required_bytes.saturating_add(reserve_bytes)
}

#[cfg(test)]
pub(crate) struct FixedProbe(pub Option<u64>);

#[cfg(test)]
impl SpaceProbe for FixedProbe {
    fn free_bytes(&self) -> std::io::Result<u64> {
        self.0
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "statfs failed"))
    }
}
