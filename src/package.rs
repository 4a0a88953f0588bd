use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use std::io::prelude::*;

/// Pull the init packet (`dat_file`) and firmware image (`bin_file`) for one
/// manifest component out of a DFU package.
pub fn extract(path: &str, component: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let reader = std::fs::File::open(path)
        .with_context(|| format!("cannot open DFU package `{}`", path))?;
    extract_from(reader, component)
}

fn extract_from<R: Read + Seek>(reader: R, component: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut zip = zip::ZipArchive::new(reader)?;

    let manifest_raw = zip
        .by_name("manifest.json")
        .context("DFU package: missing manifest.json")?;
    let manifest: Value = serde_json::from_reader(manifest_raw)?;
    let files = manifest
        .pointer(&format!("/manifest/{}", component))
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow!("DFU package: no `{}` component in manifest", component))?
        .clone();

    let mut read_part = |part: &str| -> Result<Vec<u8>> {
        let name = files
            .get(part)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("DFU package: component `{}` has no {}", component, part))?;
        let mut reader = zip
            .by_name(name)
            .with_context(|| format!("DFU package: cannot open `{}`", name))?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(data)
    };

    let dat = read_part("dat_file")?;
    let bin = read_part("bin_file")?;
    log::debug!(
        "extracted `{}`: init packet {} bytes, firmware {} bytes",
        component,
        dat.len(),
        bin.len()
    );

    Ok((dat, bin))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use zip::write::SimpleFileOptions;

    fn make_package(manifest: &str) -> Cursor<Vec<u8>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.start_file("app.dat", options).unwrap();
        writer.write_all(&[1, 2, 3]).unwrap();
        writer.start_file("app.bin", options).unwrap();
        writer.write_all(&[4, 5, 6, 7]).unwrap();
        writer.start_file("manifest.json", options).unwrap();
        writer.write_all(manifest.as_bytes()).unwrap();
        writer.finish().unwrap()
    }

    const MANIFEST: &str =
        r#"{"manifest":{"application":{"bin_file":"app.bin","dat_file":"app.dat"}}}"#;

    #[test]
    fn extracts_the_application_component() {
        let (dat, bin) = extract_from(make_package(MANIFEST), "application").unwrap();
        assert_eq!(dat, [1, 2, 3]);
        assert_eq!(bin, [4, 5, 6, 7]);
    }

    #[test]
    fn missing_component_is_an_error() {
        let err = extract_from(make_package(MANIFEST), "softdevice_bootloader").unwrap_err();
        assert!(err.to_string().contains("softdevice_bootloader"));
    }

    #[test]
    fn missing_payload_file_is_an_error() {
        let manifest = r#"{"manifest":{"application":{"bin_file":"gone.bin","dat_file":"app.dat"}}}"#;
        assert!(extract_from(make_package(manifest), "application").is_err());
    }
}
