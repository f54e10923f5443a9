//! DFU package archive unpacking: manifest parsing and image extraction.
//!
//! The core object transfer engine treats images as opaque byte pairs; this
//! module is the external collaborator spec describes as producing them.

use anyhow::{Context, Result, anyhow};
use std::io::prelude::*;

/// Which part of the device a firmware image updates.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    SoftdeviceBootloader,
    Softdevice,
    Bootloader,
    Application,
}

impl Role {
    fn manifest_key(self) -> &'static str {
        match self {
            Role::SoftdeviceBootloader => "softdevice_bootloader",
            Role::Softdevice => "softdevice",
            Role::Bootloader => "bootloader",
            Role::Application => "application",
        }
    }

    /// Canonical send order when a package carries more than one role.
    const ORDER: [Role; 4] = [
        Role::SoftdeviceBootloader,
        Role::Softdevice,
        Role::Bootloader,
        Role::Application,
    ];
}

/// One firmware image: an init packet and its firmware payload.
#[derive(Debug, Clone)]
pub struct Image {
    pub role: Role,
    pub init_packet: Vec<u8>,
    pub firmware: Vec<u8>,
}

/// An ordered sequence of images extracted from a DFU archive, in the
/// canonical send order.
#[derive(Debug, Clone, Default)]
pub struct Package {
    pub images: Vec<Image>,
}

impl Package {
    /// Unpack every role present in `path`'s manifest, in canonical order.
    pub fn open(path: &str) -> Result<Self> {
        let reader = std::fs::File::open(path)?;
        let mut zip = zip::ZipArchive::new(reader)?;

        let manifest_raw = zip
            .by_name("manifest.json")
            .context("DFU package: missing manifest.json")?;
        let manifest: serde_json::Value = serde_json::from_reader(manifest_raw)?;

        let mut images = Vec::new();
        for role in Role::ORDER {
            if let Some(image) = Self::extract_role(&mut zip, &manifest, role)? {
                images.push(image);
            }
        }
        Ok(Package { images })
    }

    /// Find the image for a specific role, if the package carries one.
    pub fn image(&self, role: Role) -> Option<&Image> {
        self.images.iter().find(|image| image.role == role)
    }

    fn extract_role(
        zip: &mut zip::ZipArchive<std::fs::File>,
        manifest: &serde_json::Value,
        role: Role,
    ) -> Result<Option<Image>> {
        let comp = &manifest["manifest"][role.manifest_key()];
        if !comp.is_object() {
            return Ok(None);
        }
        let init_packet = extract_part(zip, comp, "dat_file")?;
        let firmware = extract_part(zip, comp, "bin_file")?;
        Ok(Some(Image {
            role,
            init_packet,
            firmware,
        }))
    }
}

fn extract_part(zip: &mut zip::ZipArchive<std::fs::File>, comp: &serde_json::Value, part: &str) -> Result<Vec<u8>> {
    let part_name = comp[part]
        .as_str()
        .ok_or_else(|| anyhow!("DFU package: invalid manifest"))?;
    let mut reader = zip.by_name(part_name).context("invalid DFU package")?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_fixture() -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("manifest.json", options).unwrap();
            zip.write_all(
                br#"{"manifest":{"application":{"dat_file":"app.dat","bin_file":"app.bin"}}}"#,
            )
            .unwrap();
            zip.start_file("app.dat", options).unwrap();
            zip.write_all(b"init-bytes").unwrap();
            zip.start_file("app.bin", options).unwrap();
            zip.write_all(b"firmware-bytes").unwrap();
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn extracts_single_role_from_manifest() {
        let bytes = build_fixture();
        let path = std::env::temp_dir().join(format!("nrf-dfu-host-test-{}.zip", std::process::id()));
        std::fs::write(&path, &bytes).unwrap();

        let package = Package::open(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(package.images.len(), 1);
        let image = package.image(Role::Application).unwrap();
        assert_eq!(image.init_packet, b"init-bytes");
        assert_eq!(image.firmware, b"firmware-bytes");
        assert!(package.image(Role::Bootloader).is_none());
    }
}
