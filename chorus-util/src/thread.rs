//! Thread plumbing for device workers: named spawns and realtime
//! scheduling.

use std::ffi::CString;
use std::io;
use std::thread::JoinHandle;

// The kernel keeps 16 bytes of task name including the terminator; anything
// longer makes pthread_setname_np fail outright, so the kernel-visible name
// is truncated while std keeps the full one for panics and debuggers.
const TASK_NAME_MAX: usize = 15;

pub fn start(name: &str, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    let full = name.to_string();
    std::thread::Builder::new()
        .name(full.clone())
        .spawn(move || {
            if let Some(short) = kernel_task_name(&full) {
                unsafe {
                    libc::pthread_setname_np(libc::pthread_self(), short.as_ptr());
                }
            }
            f()
        })
        .expect("failed to spawn thread")
}

/// Truncated, nul-terminated form of `name` for the kernel, or `None` for
/// names the kernel cannot hold (interior nul).
fn kernel_task_name(name: &str) -> Option<CString> {
    let mut bytes = name.as_bytes().to_vec();
    bytes.truncate(TASK_NAME_MAX);
    CString::new(bytes).ok()
}

/// Move the calling thread onto the round-robin realtime scheduler at
/// `priority`. The caller decides how loudly failure matters; a device
/// worker keeps servicing at normal priority when the binary was not
/// granted CAP_SYS_NICE.
pub fn promote_to_realtime(priority: i32) -> io::Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_closure_runs_to_completion() {
        let handle = start("chorus/test-thread-name-overflow", || {});
        handle.join().unwrap();
    }

    #[test]
    fn kernel_name_is_truncated_not_rejected() {
        let short = kernel_task_name("chorus/dev12345678").unwrap();
        assert_eq!(short.as_bytes().len(), TASK_NAME_MAX);
        assert_eq!(short.as_bytes(), b"chorus/dev12345");
    }

    #[test]
    fn interior_nul_keeps_only_the_std_name() {
        assert_eq!(kernel_task_name("chorus\0dev"), None);
    }

    #[test]
    fn promotion_reports_instead_of_warning() {
        // with CAP_SYS_NICE this succeeds, without it the error surfaces to
        // the caller; either way nothing logs from down here
        match promote_to_realtime(10) {
            Ok(()) => {}
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
        }
    }
}
