//! Administrative operations on queue pairs owned by the transport layer.

use ibdev::{AdminQp, Ece, QpState};
use std::io;
use std::os::raw::c_int;
use std::ptr::NonNull;

/// Borrowed view of a queue pair created elsewhere. The queue pair is not
/// destroyed on drop.
pub struct IbvQp(NonNull<ibverbs_sys::ibv_qp>);

unsafe impl Send for IbvQp {}
unsafe impl Sync for IbvQp {}

impl IbvQp {
    /// # Safety
    ///
    /// `qp` must point to a live queue pair that outlives the returned value.
    pub unsafe fn from_raw(qp: *mut ibverbs_sys::ibv_qp) -> Option<Self> {
        NonNull::new(qp).map(Self)
    }
}

impl AdminQp for IbvQp {
    fn qp_num(&self) -> u32 {
        unsafe { (*self.0.as_ptr()).qp_num }
    }

    fn set_state(&self, state: QpState) -> io::Result<()> {
        unsafe {
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = {
                use ibverbs_sys::ibv_qp_state::*;
                match state {
                    QpState::Reset => IBV_QPS_RESET,
                    QpState::Init => IBV_QPS_INIT,
                    QpState::Rtr => IBV_QPS_RTR,
                    QpState::Rts => IBV_QPS_RTS,
                    QpState::Sqd => IBV_QPS_SQD,
                    QpState::Sqe => IBV_QPS_SQE,
                    QpState::Err => IBV_QPS_ERR,
                }
            };
            let mask = ibverbs_sys::ibv_qp_attr_mask::IBV_QP_STATE;
            check_errno(ibverbs_sys::ibv_modify_qp(
                self.0.as_ptr(),
                &mut attr,
                mask.0 as c_int,
            ))
        }
    }

    fn query_ece(&self) -> io::Result<Ece> {
        unsafe {
            let mut ece: ibverbs_sys::ibv_ece = std::mem::zeroed();
            check_errno(ibverbs_sys::ibv_query_ece(self.0.as_ptr(), &mut ece))?;
            Ok(Ece {
                vendor_id: ece.vendor_id,
                options: ece.options,
                comp_mask: ece.comp_mask,
            })
        }
    }

    fn set_ece(&self, ece: &Ece) -> io::Result<()> {
        let mut raw = ibverbs_sys::ibv_ece {
            vendor_id: ece.vendor_id,
            options: ece.options,
            comp_mask: ece.comp_mask,
        };
        check_errno(unsafe { ibverbs_sys::ibv_set_ece(self.0.as_ptr(), &mut raw) })
    }
}

/// QP verbs return the errno value itself on failure.
fn check_errno(rc: c_int) -> io::Result<()> {
    match rc {
        0 => Ok(()),
        rc => Err(io::Error::from_raw_os_error(rc.abs())),
    }
}
