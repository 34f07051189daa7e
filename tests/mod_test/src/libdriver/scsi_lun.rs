// Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Logical units whose behaviour the test cases script.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use scsi_backend::{ScsiCompleteCb, ScsiLun, ScsiTask, ScsiTaskResult, SubmitError};

/// Holds every submitted task until the test completes it.
pub struct ManualLun {
    name: String,
    submits: AtomicUsize,
    tasks: Mutex<Vec<(ScsiTask, Arc<dyn ScsiCompleteCb>)>>,
}

impl ManualLun {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(ManualLun {
            name: name.to_string(),
            submits: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Snapshot of the tasks not completed yet, oldest first.
    pub fn pending_tasks(&self) -> Vec<ScsiTask> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .map(|(task, _)| task.clone())
            .collect()
    }

    /// Complete the oldest pending task `times` times with `result`.
    pub fn complete_next(&self, result: ScsiTaskResult, times: usize) -> bool {
        let entry = {
            let mut tasks = self.tasks.lock().unwrap();
            if tasks.is_empty() {
                return false;
            }
            tasks.remove(0)
        };
        for _ in 0..times {
            entry.1.scsi_task_complete_cb(result.clone());
        }
        true
    }

    /// Complete every pending task as fully transferred.
    pub fn complete_all_good(&self) -> usize {
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for (_, cb) in tasks.iter() {
            cb.scsi_task_complete_cb(ScsiTaskResult::good(0));
        }
        tasks.len()
    }
}

impl ScsiLun for ManualLun {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, task: ScsiTask, cb: Arc<dyn ScsiCompleteCb>) -> Result<(), SubmitError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        self.tasks.lock().unwrap().push((task, cb));
        Ok(())
    }
}

/// Refuses every task with the same error.
pub struct RefusingLun {
    name: String,
    error: SubmitError,
    submits: AtomicUsize,
}

impl RefusingLun {
    pub fn busy(name: &str) -> Arc<Self> {
        Self::new(name, SubmitError::Busy)
    }

    pub fn failed(name: &str) -> Arc<Self> {
        Self::new(name, SubmitError::Failed("medium gone".to_string()))
    }

    fn new(name: &str, error: SubmitError) -> Arc<Self> {
        Arc::new(RefusingLun {
            name: name.to_string(),
            error,
            submits: AtomicUsize::new(0),
        })
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }
}

impl ScsiLun for RefusingLun {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, _task: ScsiTask, _cb: Arc<dyn ScsiCompleteCb>) -> Result<(), SubmitError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}
