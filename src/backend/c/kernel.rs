use super::KERNEL_ENTRY;
use crate::tensor::DeviceBuffers;
use libloading::{Library, Symbol};
use log::debug;
use std::path::{Path, PathBuf};

/// `void __convsweep_entry(void** args)` with `(input, filter, output)`
type KernelFn = unsafe extern "C" fn(*mut *mut u8);

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("failed to load library {path}: {source}")]
    Load {
        path: PathBuf,
        source: libloading::Error,
    },
    #[error("entry point '{symbol}' not found: {source}")]
    Symbol {
        symbol: String,
        source: libloading::Error,
    },
}

/// A shared library opened in this process, ready to be invoked.
pub struct LoadedKernel {
    library: Library,
    path: PathBuf,
    entry_point: String,
}

impl LoadedKernel {
    pub fn open(path: &Path, entry_point: impl Into<String>) -> Result<Self, KernelError> {
        let library = unsafe { Library::new(path) }.map_err(|source| KernelError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        unsafe { library.get::<KernelFn>(KERNEL_ENTRY.as_bytes()) }.map_err(|source| {
            KernelError::Symbol {
                symbol: KERNEL_ENTRY.to_string(),
                source,
            }
        })?;
        debug!("Loaded kernel from {}", path.display());
        Ok(Self {
            library,
            path: path.to_path_buf(),
            entry_point: entry_point.into(),
        })
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Runs the kernel once.
    ///
    /// # Safety
    /// The buffers must match the shapes and dtypes the kernel was rendered
    /// for; the generated code does no bounds checking.
    pub unsafe fn invoke(&self, buffers: &mut DeviceBuffers) -> Result<(), KernelError> {
        let kernel_fn: Symbol<KernelFn> = unsafe {
            self.library
                .get(KERNEL_ENTRY.as_bytes())
                .map_err(|source| KernelError::Symbol {
                    symbol: KERNEL_ENTRY.to_string(),
                    source,
                })?
        };
        let mut ptrs: Vec<*mut u8> = buffers
            .args_mut()
            .into_iter()
            .map(|t| t.as_mut_ptr())
            .collect();
        unsafe {
            kernel_fn(ptrs.as_mut_ptr());
        }
        Ok(())
    }
}

impl std::fmt::Debug for LoadedKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedKernel")
            .field("path", &self.path)
            .field("entry_point", &self.entry_point)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_library() {
        let dir = tempfile::tempdir().unwrap();
        let err = LoadedKernel::open(&dir.path().join("missing.so"), "conv").unwrap_err();
        assert!(matches!(err, KernelError::Load { .. }));
    }
}
