//! Shard-to-core pinning.

use tracing::{debug, warn};

/// Number of online CPU cores.
pub fn num_online_cores() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 {
        n as usize
    } else {
        1
    }
}

fn pin_to_core(core_id: usize) -> Result<(), i32> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core_id, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret == 0 {
            Ok(())
        } else {
            Err(*libc::__errno_location())
        }
    }
}

/// Pin the calling shard thread to its own core. Failure is logged, not
/// fatal; the shard just runs unpinned.
pub fn pin_shard(shard_id: usize) {
    match pin_to_core(shard_id) {
        Ok(()) => debug!(shard = shard_id, core = shard_id, "pinned shard thread"),
        Err(errno) => warn!(shard = shard_id, core = shard_id, errno, "failed to pin shard thread"),
    }
}
