//! Human-readable platform and device listing.

use std::io::{self, Write};

use crate::device::{DeviceClassFilter, DeviceDescriptor, Platform};

/// Width of the right-aligned label column.
const COL_WIDTH: usize = 38;

fn field<W: Write>(out: &mut W, label: &str, value: impl std::fmt::Display) -> io::Result<()> {
    writeln!(out, "{:>COL_WIDTH$}{}", format!("{label} : "), value)
}

fn extensions<'a, W: Write>(out: &mut W, exts: impl IntoIterator<Item = &'a String>) -> io::Result<()> {
    field(out, "EXTENSIONS", "")?;
    for ext in exts {
        writeln!(out, "{:COL_WIDTH$}{}", "", ext)?;
    }
    Ok(())
}

/// Write every platform in `platforms`, and with `include_devices` each of
/// its devices whose class passes `filter`.
pub fn print_platforms<W: Write>(
    out: &mut W,
    platforms: &[Platform],
    include_devices: bool,
    filter: DeviceClassFilter,
) -> io::Result<()> {
    for (i, platform) in platforms.iter().enumerate() {
        writeln!(out, "Platform info [ {i} ]")?;
        field(out, "PLATFORM_PROFILE", &platform.profile)?;
        field(out, "PLATFORM_VERSION", &platform.version)?;
        field(out, "PLATFORM_NAME", &platform.name)?;
        field(out, "PLATFORM_VENDOR", &platform.vendor)?;
        extensions(out, &platform.extensions)?;
        writeln!(out)?;

        if include_devices {
            for (j, device) in platform.devices_matching(filter).enumerate() {
                print_device(out, j, device)?;
            }
        }
    }
    out.flush()
}

fn print_device<W: Write>(out: &mut W, index: usize, dev: &DeviceDescriptor) -> io::Result<()> {
    writeln!(out, "Device info [ {index} ]")?;
    field(out, "DEVICE_NAME", &dev.name)?;
    field(out, "DEVICE_VENDOR", &dev.vendor)?;
    field(out, "DEVICE_TYPE", dev.class)?;
    field(out, "MAX_CLOCK_FREQUENCY", format!("{} MHz", dev.max_clock_mhz))?;
    field(out, "MAX_COMPUTE_UNITS", dev.compute_units)?;
    field(out, "MAX_WORK_GROUP_SIZE", dev.max_work_group_size)?;
    field(out, "GLOBAL_MEM_SIZE", format!("{} MB", dev.global_mem_bytes / 1024 / 1024))?;
    field(out, "MAX_MEM_ALLOC_SIZE", format!("{} MB", dev.allocation_limit() / 1024 / 1024))?;
    field(out, "LOCAL_MEM_SIZE", format!("{} KB", dev.local_mem_bytes / 1024))?;
    field(out, "LOCAL_MEM_TYPE", dev.local_mem_type)?;
    field(out, "HOST_UNIFIED_MEMORY", dev.host_unified_memory)?;
    field(out, "DEVICE_VERSION", &dev.version)?;
    field(out, "DRIVER_VERSION", &dev.driver_version)?;
    extensions(out, &dev.extensions)?;
    writeln!(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{parse_extensions, DeviceClass};

    fn sample() -> Vec<Platform> {
        let mut platform = Platform::new("Acme CL", "Acme Corp")
            .with_device(DeviceDescriptor::new("cpu0", "Acme", DeviceClass::Cpu, 3000, 16, 8 << 30))
            .with_device(DeviceDescriptor::new(
                "gpu0",
                "Acme",
                DeviceClass::Accelerator,
                1000,
                32,
                4 << 30,
            ));
        platform.extensions = parse_extensions("cl_khr_icd cl_khr_fp64");
        vec![platform]
    }

    fn render(include_devices: bool, filter: DeviceClassFilter) -> String {
        let mut buf = Vec::new();
        print_platforms(&mut buf, &sample(), include_devices, filter).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_labels_are_right_aligned() {
        let text = render(false, DeviceClassFilter::All);
        let name_line = text.lines().find(|l| l.contains("PLATFORM_NAME")).unwrap();
        assert_eq!(name_line.find("Acme CL"), Some(COL_WIDTH));
        assert!(name_line.starts_with(' '));
        let ext_line = text.lines().find(|l| l.contains("cl_khr_fp64")).unwrap();
        assert_eq!(ext_line.trim_start(), "cl_khr_fp64");
        assert_eq!(ext_line.len() - "cl_khr_fp64".len(), COL_WIDTH);
    }

    #[test]
    fn test_devices_only_when_requested() {
        assert!(!render(false, DeviceClassFilter::All).contains("Device info"));
        let text = render(true, DeviceClassFilter::All);
        assert!(text.contains("Device info [ 0 ]"));
        assert!(text.contains("Device info [ 1 ]"));
        assert!(text.contains("4096 MB"));
    }

    #[test]
    fn test_class_filter() {
        let text = render(true, DeviceClassFilter::Only(DeviceClass::Accelerator));
        assert!(text.contains("gpu0"));
        assert!(!text.contains("cpu0"));
        assert!(text.contains("Device info [ 0 ]"));
    }

    #[test]
    fn test_empty_snapshot_prints_nothing() {
        let mut buf = Vec::new();
        print_platforms(&mut buf, &[], true, DeviceClassFilter::All).unwrap();
        assert!(buf.is_empty());
    }
}
