use nix::libc;
use std::ffi::CString;
use std::os::raw::c_int;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SemaphoreError {
    #[error("semaphore operation failed: {0}")]
    Os(#[from] nix::errno::Errno),
    #[error("invalid semaphore name")]
    InvalidName,
}

/// Named POSIX counting semaphore.
///
/// The node protocol keeps its barriers as kernel objects addressed by
/// names derived from the node name, so any process that can derive the
/// name can participate without handle passing.
pub struct Semaphore {
    sem: *mut libc::sem_t,
}

impl Semaphore {
    /// Create the semaphore if it does not exist, otherwise open it.
    pub fn ensure(name: &str, initial_value: u32) -> Result<Self, SemaphoreError> {
        let c_name = CString::new(name).map_err(|_| SemaphoreError::InvalidName)?;

        let sem = unsafe { libc::sem_open(c_name.as_ptr(), libc::O_CREAT, 0o600, initial_value) };

        if sem == libc::SEM_FAILED {
            return Err(SemaphoreError::Os(nix::errno::Errno::last()));
        }

        Ok(Self { sem })
    }

    pub fn open(name: &str) -> Result<Self, SemaphoreError> {
        let c_name = CString::new(name).map_err(|_| SemaphoreError::InvalidName)?;

        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };

        if sem == libc::SEM_FAILED {
            return Err(SemaphoreError::Os(nix::errno::Errno::last()));
        }

        Ok(Self { sem })
    }

    pub fn wait(&self) -> Result<(), SemaphoreError> {
        loop {
            let ret = unsafe { libc::sem_wait(self.sem) };
            if ret == 0 {
                return Ok(());
            }
            let errno = nix::errno::Errno::last();
            if errno != nix::errno::Errno::EINTR {
                return Err(SemaphoreError::Os(errno));
            }
        }
    }

    /// Wait with a deadline. Returns `false` if the timeout elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, SemaphoreError> {
        // sem_timedwait takes an absolute CLOCK_REALTIME deadline.
        let deadline = SystemTime::now()
            .checked_add(timeout)
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .ok_or(SemaphoreError::Os(nix::errno::Errno::EINVAL))?;

        let ts = libc::timespec {
            tv_sec: deadline.as_secs() as libc::time_t,
            tv_nsec: deadline.subsec_nanos() as libc::c_long,
        };

        loop {
            let ret = unsafe { libc::sem_timedwait(self.sem, &ts) };
            if ret == 0 {
                return Ok(true);
            }
            match nix::errno::Errno::last() {
                nix::errno::Errno::ETIMEDOUT => return Ok(false),
                nix::errno::Errno::EINTR => continue,
                errno => return Err(SemaphoreError::Os(errno)),
            }
        }
    }

    pub fn try_wait(&self) -> Result<bool, SemaphoreError> {
        let ret = unsafe { libc::sem_trywait(self.sem) };
        if ret == 0 {
            Ok(true)
        } else {
            let errno = nix::errno::Errno::last();
            if errno == nix::errno::Errno::EAGAIN {
                Ok(false)
            } else {
                Err(SemaphoreError::Os(errno))
            }
        }
    }

    pub fn post(&self) -> Result<(), SemaphoreError> {
        let ret = unsafe { libc::sem_post(self.sem) };
        if ret != 0 {
            return Err(SemaphoreError::Os(nix::errno::Errno::last()));
        }
        Ok(())
    }

    /// Consume every pending count; returns how many were drained.
    pub fn drain(&self) -> Result<u32, SemaphoreError> {
        let mut drained = 0;
        while self.try_wait()? {
            drained += 1;
        }
        Ok(drained)
    }

    pub fn value(&self) -> Result<i32, SemaphoreError> {
        let mut val: c_int = 0;
        let ret = unsafe { libc::sem_getvalue(self.sem, &mut val) };
        if ret != 0 {
            return Err(SemaphoreError::Os(nix::errno::Errno::last()));
        }
        Ok(val)
    }

    pub fn unlink(name: &str) -> Result<(), SemaphoreError> {
        let c_name = CString::new(name).map_err(|_| SemaphoreError::InvalidName)?;
        let ret = unsafe { libc::sem_unlink(c_name.as_ptr()) };
        if ret != 0 {
            return Err(SemaphoreError::Os(nix::errno::Errno::last()));
        }
        Ok(())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_wait_and_value() {
        let name = "/oat_test_sem_post_wait";
        let _ = Semaphore::unlink(name);

        let sem = Semaphore::ensure(name, 0).unwrap();
        assert_eq!(sem.value().unwrap(), 0);

        sem.post().unwrap();
        sem.post().unwrap();
        assert_eq!(sem.value().unwrap(), 2);

        sem.wait().unwrap();
        assert_eq!(sem.value().unwrap(), 1);

        Semaphore::unlink(name).unwrap();
    }

    #[test]
    fn test_try_wait_on_empty_semaphore() {
        let name = "/oat_test_sem_try_wait";
        let _ = Semaphore::unlink(name);

        let sem = Semaphore::ensure(name, 1).unwrap();
        assert!(sem.try_wait().unwrap());
        assert!(!sem.try_wait().unwrap());

        Semaphore::unlink(name).unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let name = "/oat_test_sem_timeout";
        let _ = Semaphore::unlink(name);

        let sem = Semaphore::ensure(name, 0).unwrap();
        let start = std::time::Instant::now();
        let got = sem.wait_timeout(Duration::from_millis(50)).unwrap();

        assert!(!got, "wait should time out on an empty semaphore");
        assert!(start.elapsed() >= Duration::from_millis(50));

        Semaphore::unlink(name).unwrap();
    }

    #[test]
    fn test_drain_consumes_stale_counts() {
        let name = "/oat_test_sem_drain";
        let _ = Semaphore::unlink(name);

        let sem = Semaphore::ensure(name, 3).unwrap();
        assert_eq!(sem.drain().unwrap(), 3);
        assert!(!sem.try_wait().unwrap());

        Semaphore::unlink(name).unwrap();
    }
}
