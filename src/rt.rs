//! Real-time scheduling for the ingest thread.
//!
//! Best effort only: on failure (typically missing privileges) the thread
//! keeps running at normal priority and a warning is logged.

#[cfg(any(target_os = "linux", windows))]
use log::warn;

/// Round-robin real-time priority requested for the ingest thread.
#[cfg(target_os = "linux")]
const RT_PRIORITY: libc::c_int = 1;

#[cfg(target_os = "linux")]
pub fn elevate_current_thread(pin_core: Option<usize>) {
    unsafe {
        let param = libc::sched_param {
            sched_priority: RT_PRIORITY,
        };
        if libc::sched_setscheduler(0, libc::SCHED_RR, &param) != 0 {
            warn!("sched_setscheduler(SCHED_RR) failed; running at normal priority");
        }
        if let Some(core) = pin_core {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(core, &mut set);
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                warn!("failed to pin ingest thread to core {}", core);
            }
        }
    }
}

#[cfg(windows)]
pub fn elevate_current_thread(_pin_core: Option<usize>) {
    use windows_sys::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_TIME_CRITICAL,
    };
    unsafe {
        if SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL) == 0 {
            warn!("SetThreadPriority failed; running at normal priority");
        }
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
pub fn elevate_current_thread(_pin_core: Option<usize>) {}
