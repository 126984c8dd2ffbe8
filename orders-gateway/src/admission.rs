//! 注文作成の同時実行ガード
//!
//! レート制限（リクエスト頻度）とは独立に、作成処理の同時実行数そのものを
//! 固定上限で抑える。枠が無ければ待たずに即時 Overloaded を返す。
//! permit は RAII ガードで、早期 return やエラーでも Drop で返却される。

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 注文作成用の permit プール
#[derive(Clone)]
pub struct AdmissionSemaphore {
    permits: Arc<Semaphore>,
    max_permits: usize,
}

impl AdmissionSemaphore {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_permits: max_concurrent,
        }
    }

    /// 非ブロッキングで permit を1つ取得する。枠が無ければ None。
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }
}
