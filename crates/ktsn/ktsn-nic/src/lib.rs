//! The NIC driver contract.
//!
//! EAL init, device configuration, and mempool setup
//! (`rte_eal_init`/`port_init`/`rte_pktmbuf_pool_create` in the source) are
//! kernel-bypass driver plumbing, explicitly out of scope (§1) — the
//! scheduling core only needs somewhere to hand a finished frame to, which
//! is what `NicDriver` captures.

#[derive(Debug, thiserror::Error)]
pub enum NicError {
    #[error("NIC rejected the frame")]
    Rejected,
}

/// A single egress queue on a kernel-bypass NIC port.
///
/// `submit` takes one already-built frame (Ethernet header onward, as
/// produced by `ktsn_proto::build_frame_into`) and hands it to the
/// driver's tx queue. The source's `rte_eth_tx_burst(port_id, queue_id, &tx_buf, 1)`
/// is this call with a burst of one, matching the sender loop's one
/// frame per dispatched deadline (§4.4 Case C).
pub trait NicDriver {
    fn submit(&mut self, frame: &[u8]) -> Result<(), NicError>;
}

/// A `NicDriver` that records every frame handed to it instead of sending
/// anything, for tests and for running the sender loop without hardware.
#[derive(Default)]
pub struct NullNic {
    submitted: Vec<Vec<u8>>,
}

impl NullNic {
    pub fn new() -> Self {
        NullNic::default()
    }

    pub fn submitted(&self) -> &[Vec<u8>] {
        &self.submitted
    }
}

impl NicDriver for NullNic {
    fn submit(&mut self, frame: &[u8]) -> Result<(), NicError> {
        self.submitted.push(frame.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_nic_records_every_submitted_frame() {
        let mut nic = NullNic::new();
        nic.submit(&[1, 2, 3]).unwrap();
        nic.submit(&[4, 5]).unwrap();
        assert_eq!(nic.submitted(), &[vec![1, 2, 3], vec![4, 5]]);
    }
}
