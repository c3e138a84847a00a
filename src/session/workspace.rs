//! 会话工作区：每个会话独占一棵目录树

use std::path::Path;

pub const INPUTS: &str = "inputs";
pub const OUTPUTS: &str = "outputs";
pub const LOGS: &str = "logs";
pub const CHECKPOINTS: &str = "checkpoints";

/// 确保 inputs / outputs / logs / checkpoints 存在（可重复调用）
pub async fn prepare(workspace: &Path) -> std::io::Result<()> {
    for dir in [INPUTS, OUTPUTS, LOGS, CHECKPOINTS] {
        tokio::fs::create_dir_all(workspace.join(dir)).await?;
    }
    Ok(())
}

/// 删除整个工作区；目录不存在时视为成功
pub async fn remove(workspace: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(workspace).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prepare_is_idempotent_and_remove_tolerates_missing() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("sessions/abc");
        prepare(&ws).await.unwrap();
        prepare(&ws).await.unwrap();
        assert!(ws.join(INPUTS).is_dir());
        assert!(ws.join(OUTPUTS).is_dir());

        remove(&ws).await.unwrap();
        assert!(!ws.exists());
        remove(&ws).await.unwrap();
    }
}
