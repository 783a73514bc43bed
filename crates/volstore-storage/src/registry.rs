//! Device to volume registry
//!
//! Built once at startup from the configured devices and shared read-only
//! by every request afterwards.

use crate::diskfile::{DiskFile, DiskFileOptions, ObjectFile};
use crate::volume::{PosixVolume, Volume};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use volstore_common::config::StorageConfig;
use volstore_common::{DeviceName, Error, ObjectPath, Result};

/// Volumes served by this node, keyed by device
#[derive(Debug)]
pub struct VolumeRegistry {
    volumes: HashMap<DeviceName, Arc<dyn Volume>>,
    options: DiskFileOptions,
}

impl VolumeRegistry {
    #[must_use]
    pub fn builder() -> VolumeRegistryBuilder {
        VolumeRegistryBuilder::default()
    }

    /// Mount every configured device as a POSIX volume
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let mut builder = Self::builder().options(DiskFileOptions {
            preallocate: config.preallocate,
        });
        for device in &config.devices {
            let name = DeviceName::new(device.name.as_str())?;
            let volume = PosixVolume::mount(&device.path)?;
            info!("Device {} -> {}", name, device.path.display());
            builder = builder.add(name, Arc::new(volume))?;
        }
        Ok(builder.build())
    }

    /// Volume backing a device
    pub fn get(&self, device: &str) -> Result<Arc<dyn Volume>> {
        self.volumes
            .get(device)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(device.to_string()))
    }

    /// Initialise a lifecycle controller for one object on one device
    pub fn disk_file(&self, device: &str, path: ObjectPath) -> Result<Box<dyn ObjectFile>> {
        let volume = self.get(device)?;
        Ok(DiskFile::open_handle(volume, path, self.options))
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceName> {
        self.volumes.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    #[must_use]
    pub const fn options(&self) -> DiskFileOptions {
        self.options
    }
}

/// Accumulates volumes before the registry is frozen
#[derive(Default)]
pub struct VolumeRegistryBuilder {
    volumes: HashMap<DeviceName, Arc<dyn Volume>>,
    options: DiskFileOptions,
}

impl VolumeRegistryBuilder {
    /// Register a volume under a device name
    pub fn add(mut self, device: DeviceName, volume: Arc<dyn Volume>) -> Result<Self> {
        if self.volumes.contains_key(&device) {
            return Err(Error::Configuration(format!(
                "device {device} registered twice"
            )));
        }
        self.volumes.insert(device, volume);
        Ok(self)
    }

    #[must_use]
    pub const fn options(mut self, options: DiskFileOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn build(self) -> VolumeRegistry {
        VolumeRegistry {
            volumes: self.volumes,
            options: self.options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::MemoryVolume;
    use tempfile::tempdir;
    use volstore_common::config::DeviceConfig;
    use volstore_common::ObjectState;

    #[test]
    fn test_lookup_by_device() {
        let registry = VolumeRegistry::builder()
            .add(DeviceName::new("sdb1").unwrap(), Arc::new(MemoryVolume::new()))
            .unwrap()
            .build();

        assert_eq!(registry.len(), 1);
        assert!(registry.get("sdb1").is_ok());
        let err = registry.get("sdc1").unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
        assert_eq!(err.http_status_code(), 503);
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let builder = VolumeRegistry::builder()
            .add(DeviceName::new("sdb1").unwrap(), Arc::new(MemoryVolume::new()))
            .unwrap();
        let err = builder
            .add(DeviceName::new("sdb1").unwrap(), Arc::new(MemoryVolume::new()))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_from_config_mounts_devices() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            devices: vec![DeviceConfig {
                name: "vol0".into(),
                path: dir.path().to_path_buf(),
            }],
            preallocate: false,
        };

        let registry = VolumeRegistry::from_config(&config).unwrap();
        assert_eq!(registry.devices().count(), 1);
        assert!(!registry.options().preallocate);

        let missing = StorageConfig {
            devices: vec![DeviceConfig {
                name: "vol1".into(),
                path: dir.path().join("not-mounted"),
            }],
            preallocate: true,
        };
        assert!(VolumeRegistry::from_config(&missing).is_err());
    }

    #[test]
    fn test_disk_file_uses_device_volume() {
        let volume = MemoryVolume::new();
        volume.write_file("/a/c/o", b"payload").unwrap();
        let registry = VolumeRegistry::builder()
            .add(DeviceName::new("sdb1").unwrap(), Arc::new(volume))
            .unwrap()
            .build();

        let path = ObjectPath::new("a", "c", "o").unwrap();
        let file = registry.disk_file("sdb1", path.clone()).unwrap();
        assert_eq!(file.object_state(), ObjectState::Consumable);

        assert!(registry.disk_file("nope", path).is_err());
    }
}
