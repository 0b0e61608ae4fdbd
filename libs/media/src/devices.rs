//! Audio device lookup and enumeration.

use crate::error::{MediaError, MediaResult};
use cpal::traits::{DeviceTrait, HostTrait};

/// List available input (microphone) device names
pub fn list_input_devices() -> MediaResult<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// List available output (speaker) device names
pub fn list_output_devices() -> MediaResult<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

pub fn default_input_device_name() -> MediaResult<String> {
    let device = find_input_device(None)?;
    device
        .name()
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))
}

pub fn default_output_device_name() -> MediaResult<String> {
    let device = find_output_device(None)?;
    device
        .name()
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))
}

/// Resolve a named input device, or the host default when `name` is `None`.
pub(crate) fn find_input_device(name: Option<&str>) -> MediaResult<cpal::Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| MediaError::DeviceUnavailable("no input device".to_string())),
        Some(wanted) => host
            .input_devices()
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| {
                MediaError::DeviceUnavailable(format!("input device '{wanted}' not found"))
            }),
    }
}

pub(crate) fn find_output_device(name: Option<&str>) -> MediaResult<cpal::Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| MediaError::DeviceUnavailable("no output device".to_string())),
        Some(wanted) => host
            .output_devices()
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| {
                MediaError::DeviceUnavailable(format!("output device '{wanted}' not found"))
            }),
    }
}
