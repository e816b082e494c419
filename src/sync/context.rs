// src/sync/context.rs

use crate::{
    config::store::SettingsStore,
    constants::{settings_keys as keys, sync},
    error::AppResult,
    models::Playlist,
};
use log::{info, warn};
use rand::Rng;
use std::sync::Arc;

/// 设备在重启之间需要记住的状态，全部保存在 [`SettingsStore`] 中。
#[derive(Clone)]
pub struct SyncContext {
    store: Arc<dyn SettingsStore>,
}

impl SyncContext {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    pub fn is_paired(&self) -> bool {
        self.store.get(keys::PAIRED).as_deref() == Some("true")
    }

    pub fn set_paired(&self, paired: bool) -> AppResult<()> {
        if self.is_paired() != paired {
            info!("配对状态变更为: {}", paired);
        }
        self.store
            .set(keys::PAIRED, if paired { "true" } else { "false" })
    }

    pub fn pairing_code(&self) -> Option<String> {
        self.store.get(keys::PAIRING_CODE).filter(|c| !c.is_empty())
    }

    /// 返回已保存的配对码，没有时生成一个新的并保存。
    pub fn ensure_pairing_code(&self) -> AppResult<String> {
        match self.pairing_code() {
            Some(code) => Ok(code),
            None => self.regenerate_pairing_code(),
        }
    }

    pub fn regenerate_pairing_code(&self) -> AppResult<String> {
        let code = generate_pairing_code();
        self.store.set(keys::PAIRING_CODE, &code)?;
        info!("生成新的配对码: {}", code);
        Ok(code)
    }

    pub fn clear_pairing_code(&self) -> AppResult<()> {
        self.store.remove(keys::PAIRING_CODE)
    }

    /// 最近一次成功交付的（远程、已解析的）播放列表。
    pub fn applied_playlist(&self) -> Option<Playlist> {
        let raw = self.store.get(keys::APPLIED_PLAYLIST)?;
        match serde_json::from_str(&raw) {
            Ok(playlist) => Some(playlist),
            Err(e) => {
                warn!("已保存的播放列表无法解析，视为未应用: {}", e);
                None
            }
        }
    }

    pub fn save_applied_playlist(&self, playlist: &Playlist) -> AppResult<()> {
        self.store
            .set(keys::APPLIED_PLAYLIST, &serde_json::to_string(playlist)?)
    }

    pub fn clear_applied_playlist(&self) -> AppResult<()> {
        self.store.remove(keys::APPLIED_PLAYLIST)
    }

    /// 设备的稳定标识，第一次使用时生成。
    pub fn device_id(&self) -> AppResult<String> {
        if let Some(id) = self.store.get(keys::DEVICE_ID)
            && !id.is_empty()
        {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.store.set(keys::DEVICE_ID, &id)?;
        info!("生成设备标识: {}", id);
        Ok(id)
    }

    /// 忘记配对和播放内容，保留设备标识。
    pub fn forget(&self) -> AppResult<()> {
        self.store.remove(keys::PAIRED)?;
        self.store.remove(keys::PAIRING_CODE)?;
        self.store.remove(keys::APPLIED_PLAYLIST)
    }
}

fn generate_pairing_code() -> String {
    let mut rng = rand::thread_rng();
    (0..sync::PAIRING_CODE_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..sync::PAIRING_CODE_ALPHABET.len());
            sync::PAIRING_CODE_ALPHABET[idx] as char
        })
        .collect()
}
