use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

// --- Hardware endpoints ----------------------------------------------------
//
// The audio processor sits on an I2C bus; the amplifier's mains state is
// exposed by a one-byte sensor file. Both are behind small traits so the
// controller can be driven without hardware.

const I2C_SLAVE: libc::c_ulong = 0x0703;

pub trait AudioBus: Send {
    /// Writes one register sequence; the whole buffer must go out at once.
    fn write(&mut self, bytes: &[u8]) -> anyhow::Result<()>;
}

pub trait PowerSensor: Send + Sync {
    fn is_powered_on(&self) -> bool;
}

/// Character device of a Linux I2C adapter bound to one slave address.
pub struct I2cBus {
    path: PathBuf,
    file: Option<File>,
}

impl I2cBus {
    /// Opens the adapter. Failure is logged and leaves a bus on which every
    /// write fails, so the rest of the controller keeps working.
    pub fn open(path: impl Into<PathBuf>, address: u16) -> Self {
        let path = path.into();
        let file = match Self::open_slave(&path, address) {
            Ok(f) => Some(f),
            Err(e) => {
                tracing::error!("could not open {}: {e:#}", path.display());
                None
            }
        };
        Self { path, file }
    }

    fn open_slave(path: &Path, address: u16) -> anyhow::Result<File> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // SAFETY: I2C_SLAVE takes the slave address by value and the fd is
        // owned by `file` for the duration of the call.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), I2C_SLAVE as _, address as libc::c_ulong) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(file)
    }
}

impl AudioBus for I2cBus {
    fn write(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        let Some(file) = self.file.as_mut() else {
            anyhow::bail!("{} is not open", self.path.display());
        };
        let n = file.write(bytes)?;
        if n != bytes.len() {
            anyhow::bail!("short write to {} ({n} of {} bytes)", self.path.display(), bytes.len());
        }
        Ok(())
    }
}

/// Reads the first byte of the sensor file: `'1'` means powered on, anything
/// else (including a missing file) means off.
pub struct FilePowerSensor {
    path: PathBuf,
}

impl FilePowerSensor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PowerSensor for FilePowerSensor {
    fn is_powered_on(&self) -> bool {
        let mut c = [b'0'];
        File::open(&self.path)
            .and_then(|mut f| f.read_exact(&mut c))
            .map(|_| c[0] == b'1')
            .unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records successful writes; fails the next `fail` writes.
    #[derive(Default, Clone)]
    pub(crate) struct FakeBus {
        pub(crate) writes: Arc<Mutex<Vec<Vec<u8>>>>,
        pub(crate) fail: Arc<AtomicUsize>,
    }

    impl FakeBus {
        pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl AudioBus for FakeBus {
        fn write(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
            if self
                .fail
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("i2c: remote I/O error");
            }
            self.writes.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    pub(crate) struct FakeSensor(pub(crate) Arc<AtomicBool>);

    impl FakeSensor {
        pub(crate) fn set(&self, on: bool) {
            self.0.store(on, Ordering::SeqCst);
        }
    }

    impl PowerSensor for FakeSensor {
        fn is_powered_on(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_power_sensor_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("powersensor");
        let sensor = FilePowerSensor::new(&path);
        assert!(!sensor.is_powered_on());

        std::fs::write(&path, "1\n").unwrap();
        assert!(sensor.is_powered_on());

        std::fs::write(&path, "0").unwrap();
        assert!(!sensor.is_powered_on());

        std::fs::write(&path, "").unwrap();
        assert!(!sensor.is_powered_on());
    }

    #[test]
    fn test_unopened_bus_fails_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut bus = I2cBus::open(dir.path().join("i2c-9"), 0x44);
        assert!(bus.write(&[0x00, 0x40]).is_err());
    }

    #[test]
    fn test_fake_bus_failure_budget() {
        let mut bus = FakeBus::default();
        bus.fail.store(2, Ordering::SeqCst);
        assert!(bus.write(&[1]).is_err());
        assert!(bus.write(&[2]).is_err());
        assert!(bus.write(&[3]).is_ok());
        assert_eq!(bus.writes(), vec![vec![3]]);
    }
}
