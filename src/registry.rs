//! Registry value lookup. Only Windows nodes have a registry; elsewhere
//! every well-formed key reads as absent.

use crate::error::DeployError;
use crate::wire::{RegistryCall, RegistryValue, Response};
use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryRoot {
    LocalMachine,
    CurrentUser,
    ClassesRoot,
    Users,
    CurrentConfig,
}

/// Split `HKLM\Software\Vendor` into its root and sub-key
pub fn parse_key(key: &str) -> Result<(RegistryRoot, String)> {
    let trimmed = key.trim().trim_matches('\\');
    let (root, rest) = match trimmed.split_once('\\') {
        Some((r, rest)) => (r, rest),
        None => (trimmed, ""),
    };
    let root = match root.to_ascii_uppercase().as_str() {
        "HKLM" | "HKEY_LOCAL_MACHINE" => RegistryRoot::LocalMachine,
        "HKCU" | "HKEY_CURRENT_USER" => RegistryRoot::CurrentUser,
        "HKCR" | "HKEY_CLASSES_ROOT" => RegistryRoot::ClassesRoot,
        "HKU" | "HKEY_USERS" => RegistryRoot::Users,
        "HKCC" | "HKEY_CURRENT_CONFIG" => RegistryRoot::CurrentConfig,
        _ => return Err(DeployError::MalformedRegistryKey(key.to_string()).into()),
    };
    Ok((root, rest.to_string()))
}

pub fn call(call: RegistryCall) -> Result<Response> {
    match call {
        RegistryCall::Read { key, value_name } => {
            Ok(Response::Registry(read_value(&key, &value_name)?))
        }
    }
}

pub fn read_value(key: &str, value_name: &str) -> Result<Option<RegistryValue>> {
    let (root, subkey) = parse_key(key)?;
    read_native(root, &subkey, value_name)
}

#[cfg(not(windows))]
fn read_native(_root: RegistryRoot, _subkey: &str, _value_name: &str) -> Result<Option<RegistryValue>> {
    Ok(None)
}

#[cfg(windows)]
fn read_native(root: RegistryRoot, subkey: &str, value_name: &str) -> Result<Option<RegistryValue>> {
    use windows::core::{HSTRING, PCWSTR};
    use windows::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_PATH_NOT_FOUND, ERROR_SUCCESS};
    use windows::Win32::System::Registry::{
        RegGetValueW, HKEY, HKEY_CLASSES_ROOT, HKEY_CURRENT_CONFIG, HKEY_CURRENT_USER,
        HKEY_LOCAL_MACHINE, HKEY_USERS, REG_DWORD, REG_VALUE_TYPE, RRF_RT_REG_DWORD,
        RRF_RT_REG_SZ,
    };

    let hkey: HKEY = match root {
        RegistryRoot::LocalMachine => HKEY_LOCAL_MACHINE,
        RegistryRoot::CurrentUser => HKEY_CURRENT_USER,
        RegistryRoot::ClassesRoot => HKEY_CLASSES_ROOT,
        RegistryRoot::Users => HKEY_USERS,
        RegistryRoot::CurrentConfig => HKEY_CURRENT_CONFIG,
    };
    let sub = HSTRING::from(subkey);
    let name = HSTRING::from(value_name);
    let flags = RRF_RT_REG_SZ | RRF_RT_REG_DWORD;

    let mut kind = REG_VALUE_TYPE::default();
    let mut size = 0u32;
    let status = unsafe {
        RegGetValueW(
            hkey,
            PCWSTR(sub.as_ptr()),
            PCWSTR(name.as_ptr()),
            flags,
            Some(&mut kind as *mut _),
            None,
            Some(&mut size as *mut _),
        )
    };
    if status == ERROR_FILE_NOT_FOUND || status == ERROR_PATH_NOT_FOUND {
        return Ok(None);
    }
    if status != ERROR_SUCCESS {
        anyhow::bail!("read registry value {}\\{} failed: {:?}", subkey, value_name, status);
    }

    let mut buf = vec![0u8; size as usize];
    let status = unsafe {
        RegGetValueW(
            hkey,
            PCWSTR(sub.as_ptr()),
            PCWSTR(name.as_ptr()),
            flags,
            Some(&mut kind as *mut _),
            Some(buf.as_mut_ptr().cast()),
            Some(&mut size as *mut _),
        )
    };
    if status != ERROR_SUCCESS {
        anyhow::bail!("read registry value {}\\{} failed: {:?}", subkey, value_name, status);
    }
    buf.truncate(size as usize);

    if kind == REG_DWORD {
        let mut dword = [0u8; 4];
        dword.copy_from_slice(&buf[..4]);
        return Ok(Some(RegistryValue::Dword(u32::from_le_bytes(dword))));
    }
    let wide: Vec<u16> = buf
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&c| c != 0)
        .collect();
    Ok(Some(RegistryValue::String(String::from_utf16_lossy(&wide))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_and_long_roots() {
        let (root, sub) = parse_key("HKLM\\Software\\Vendor").unwrap();
        assert_eq!(root, RegistryRoot::LocalMachine);
        assert_eq!(sub, "Software\\Vendor");
        let (root, _) = parse_key("hkey_current_user\\Environment").unwrap();
        assert_eq!(root, RegistryRoot::CurrentUser);
        let (root, sub) = parse_key("HKU").unwrap();
        assert_eq!(root, RegistryRoot::Users);
        assert!(sub.is_empty());
    }

    #[test]
    fn malformed_root_is_an_error() {
        let err = parse_key("HKXX\\Software").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::MalformedRegistryKey(_))
        ));
        assert!(read_value("Software\\Vendor", "x").is_err());
    }

    #[cfg(not(windows))]
    #[test]
    fn well_formed_keys_are_absent_off_windows() {
        assert_eq!(read_value("HKLM\\Software\\Vendor", "Version").unwrap(), None);
    }
}
