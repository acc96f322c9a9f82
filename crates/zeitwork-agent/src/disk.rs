use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// File name of the root disk inside a VM working directory.
const ROOTFS_NAME: &str = "rootfs.ext4";

/// Materialize a VM's root disk from the image store into its working
/// directory.
///
/// The copy is what makes VM state disposable: the store copy stays
/// pristine, the per-VM copy is writable and deleted with the VM. Losing a
/// working directory just means re-materializing on the next reconcile.
pub async fn materialize(image_store: &Path, disk_image_key: &str, vm_dir: &Path) -> Result<PathBuf> {
    let source = image_store.join(disk_image_key);
    let target = vm_dir.join(ROOTFS_NAME);

    if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
        anyhow::bail!("Disk image {} not present in store", disk_image_key);
    }

    tokio::fs::create_dir_all(vm_dir)
        .await
        .with_context(|| format!("Failed to create VM dir {}", vm_dir.display()))?;

    tokio::fs::copy(&source, &target).await.with_context(|| {
        format!(
            "Failed to materialize {} -> {}",
            source.display(),
            target.display()
        )
    })?;

    Ok(target)
}

/// Remove a VM's working directory and everything in it (disk, boot
/// manifest, sockets, log files).
pub async fn cleanup(vm_dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(vm_dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove VM dir {}", vm_dir.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_materialize_copies_image() {
        let store = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        std::fs::write(store.path().join("disk-abc.img"), b"image-bytes").unwrap();

        let vm_dir = state.path().join("vm-1");
        let rootfs = materialize(store.path(), "disk-abc.img", &vm_dir).await.unwrap();

        assert_eq!(std::fs::read(&rootfs).unwrap(), b"image-bytes");
        // Source copy untouched.
        assert!(store.path().join("disk-abc.img").exists());
    }

    #[tokio::test]
    async fn test_materialize_missing_image_fails() {
        let store = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();

        let err = materialize(store.path(), "nope.img", &state.path().join("vm"))
            .await
            .unwrap_err();
        assert!(format!("{}", err).contains("not present"));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let state = tempfile::tempdir().unwrap();
        let vm_dir = state.path().join("vm-2");
        std::fs::create_dir_all(&vm_dir).unwrap();
        std::fs::write(vm_dir.join("rootfs.ext4"), b"x").unwrap();

        cleanup(&vm_dir).await.unwrap();
        assert!(!vm_dir.exists());
        // Second pass on a missing dir is fine.
        cleanup(&vm_dir).await.unwrap();
    }
}
