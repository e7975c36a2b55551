//! Runtime loading of vendor shared libraries.
//!
//! The accelerator runtime and the post-processing library only exist on the
//! board image, so they are opened with `dlopen` when a backend is built
//! rather than linked at compile time.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

pub(crate) struct DynamicLibrary {
    path: PathBuf,
    #[cfg(target_os = "linux")]
    handle: *mut libc::c_void,
}

// The handle is only used for symbol lookup and dlclose; both are thread safe.
unsafe impl Send for DynamicLibrary {}

impl DynamicLibrary {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("shared library {} not found", path.display()));
        }
        Self::open_impl(path)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(target_os = "linux")]
    fn open_impl(path: &Path) -> Result<Self> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| anyhow!("library path {} contains NUL", path.display()))?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(anyhow!(
                "dlopen {} failed: {}",
                path.display(),
                last_dl_error()
            ));
        }
        log::debug!("loaded {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            handle,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn open_impl(path: &Path) -> Result<Self> {
        Err(anyhow!(
            "cannot load {}: vendor libraries are only supported on linux",
            path.display()
        ))
    }

    /// Resolve `name` as a function pointer of type `F`.
    ///
    /// # Safety
    /// `F` must be an `extern "C" fn` type matching the symbol's real signature.
    #[cfg(target_os = "linux")]
    pub(crate) unsafe fn symbol<F: Copy>(&self, name: &str) -> Result<F> {
        use std::ffi::CString;

        if std::mem::size_of::<F>() != std::mem::size_of::<*mut libc::c_void>() {
            return Err(anyhow!("symbol type for {} is not a function pointer", name));
        }
        let c_name = CString::new(name).map_err(|_| anyhow!("symbol name {} contains NUL", name))?;
        let ptr = libc::dlsym(self.handle, c_name.as_ptr());
        if ptr.is_null() {
            return Err(anyhow!(
                "symbol {} missing from {}",
                name,
                self.path.display()
            ));
        }
        Ok(std::mem::transmute_copy::<*mut libc::c_void, F>(&ptr))
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) unsafe fn symbol<F: Copy>(&self, name: &str) -> Result<F> {
        Err(anyhow!("symbol {} unavailable on this platform", name))
    }
}

#[cfg(target_os = "linux")]
fn last_dl_error() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        return "unknown error".to_string();
    }
    unsafe { std::ffi::CStr::from_ptr(err) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(target_os = "linux")]
impl Drop for DynamicLibrary {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { libc::dlclose(self.handle) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_an_error() {
        let err = DynamicLibrary::open(Path::new("/nonexistent/libdnn.so"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("not found"));
    }
}
