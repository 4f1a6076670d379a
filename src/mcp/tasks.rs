//! 优先级任务调度
//!
//! 队列里只放任务 ID；任务本身落在台账里。出队后转成请求走 dispatch_request，
//! 结果（或错误）与消息 ID 回写到任务记录上。

use chrono::Utc;
use serde_json::Value;

use super::MasterControlProgram;
use crate::core::McpError;
use crate::ledger::{Payload, Priority, Status, Task};

/// 提交任务的参数
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: String,
    pub action: String,
    pub payload: Payload,
    pub priority: Priority,
    /// 指定处理的 Agent；为空时按 task_type 推断
    pub target_agent_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            action: action.into(),
            payload: Payload::new(),
            priority: Priority::default(),
            target_agent_id: None,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_target(mut self, agent_id: impl Into<String>) -> Self {
        self.target_agent_id = Some(agent_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// 任务已被取消时的状态迁移错误
fn was_canceled(err: &McpError) -> bool {
    matches!(
        err,
        McpError::InvalidTransition {
            from: Status::Canceled,
            ..
        }
    )
}

impl MasterControlProgram {
    /// 持久化任务（PENDING）并按优先级入队，唤醒任务消费者
    pub async fn submit_task(&self, new_task: NewTask) -> Result<Task, McpError> {
        if new_task.task_type.trim().is_empty() {
            return Err(McpError::InvalidArgument(
                "task type must not be empty".to_string(),
            ));
        }
        let task = Task {
            priority: new_task.priority,
            target_agent_id: new_task.target_agent_id,
            correlation_id: new_task.correlation_id,
            ..Task::new(new_task.task_type, new_task.action, new_task.payload)
        };

        self.retry
            .run_insert("insert_task", || self.ledger.insert_task(&task))
            .await?;
        self.queue.lock().await.enqueue(task.id.clone(), task.priority);
        tracing::info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = %task.priority,
            "Task submitted"
        );
        self.task_signal.notify_one();
        Ok(task)
    }

    /// 取出并执行优先级最高的任务；队列为空时返回 None
    ///
    /// 已被取消或已不存在的任务会被跳过。读取任务或写入 PROCESSING 失败时，
    /// 任务 ID 放回原优先级组的队首后返回错误。
    pub async fn process_next_task(&self) -> Result<Option<Task>, McpError> {
        loop {
            let Some((task_id, queued_priority)) = self.queue.lock().await.pop() else {
                return Ok(None);
            };
            let fetched = self
                .retry
                .run("get_task", || self.ledger.get_task(&task_id))
                .await;
            let mut task = match fetched {
                Ok(Some(task)) => task,
                Ok(None) => {
                    tracing::warn!(task_id = %task_id, "Queued task missing from ledger, skipped");
                    continue;
                }
                Err(e) => {
                    self.requeue_task(task_id, queued_priority).await;
                    return Err(e);
                }
            };
            if task.status != Status::Pending {
                tracing::debug!(task_id = %task.id, status = %task.status, "Queued task no longer pending, skipped");
                continue;
            }

            task.status = Status::Processing;
            task.updated_at = Utc::now();
            match self
                .retry
                .run("update_task", || self.ledger.update_task(&task))
                .await
            {
                Ok(()) => {}
                Err(e) if was_canceled(&e) => {
                    tracing::debug!(task_id = %task.id, "Task canceled before processing, skipped");
                    continue;
                }
                Err(e) => {
                    self.requeue_task(task.id, queued_priority).await;
                    return Err(e);
                }
            }

            return self.run_task(task).await.map(Some);
        }
    }

    async fn requeue_task(&self, task_id: String, priority: Priority) {
        tracing::warn!(task_id = %task_id, priority = %priority, "Task returned to queue after ledger failure");
        self.queue.lock().await.enqueue_front(task_id, priority);
    }

    /// 依次处理队列中的全部任务，返回处理数
    pub async fn run_pending_tasks(&self) -> Result<usize, McpError> {
        let mut processed = 0;
        while self.process_next_task().await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// 取消尚未结束的任务；终态任务返回 INVALID_STATUS_TRANSITION
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task, McpError> {
        let mut task = self.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(McpError::InvalidTransition {
                id: task.id,
                from: task.status,
                to: Status::Canceled,
            });
        }

        let dequeued = self.queue.lock().await.remove(&task.id);
        task.status = Status::Canceled;
        task.updated_at = Utc::now();
        self.retry
            .run("update_task", || self.ledger.update_task(&task))
            .await?;
        tracing::info!(task_id, dequeued, "Task canceled");
        Ok(task)
    }

    /// 调整排队中任务的优先级：移到新优先级组队尾
    pub async fn change_task_priority(
        &self,
        task_id: &str,
        priority: Priority,
    ) -> Result<Task, McpError> {
        let mut task = self.get_task(task_id).await?;
        if task.status != Status::Pending {
            return Err(McpError::InvalidArgument(format!(
                "task {task_id} is {} and can no longer be reprioritized",
                task.status
            )));
        }

        let moved = self.queue.lock().await.change_priority(&task.id, priority);
        if !moved {
            return Err(McpError::InvalidArgument(format!(
                "task {task_id} is not queued"
            )));
        }
        let previous = task.priority;
        task.priority = priority;
        task.updated_at = Utc::now();
        self.retry
            .run("update_task", || self.ledger.update_task(&task))
            .await?;
        tracing::info!(task_id, from = %previous, to = %priority, "Task priority changed");
        Ok(task)
    }

    pub async fn pending_tasks(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task, McpError> {
        self.retry
            .run("get_task", || self.ledger.get_task(task_id))
            .await?
            .ok_or_else(|| McpError::TaskNotFound(task_id.to_string()))
    }

    pub async fn list_tasks(&self, status: Option<Status>) -> Result<Vec<Task>, McpError> {
        self.retry
            .run("list_tasks", || self.ledger.list_tasks(status))
            .await
    }

    /// PROCESSING → COMPLETED | FAILED；中途被取消时返回取消后的记录
    async fn run_task(&self, mut task: Task) -> Result<Task, McpError> {
        tracing::debug!(task_id = %task.id, target = ?task.target_agent_id, "Task dispatching");
        let response = self
            .dispatch_request(task.to_request(), task.target_agent_id.as_deref())
            .await;

        if let Some(message_id) = &response.message_id {
            task.assigned_agent_id = self
                .retry
                .run("get_message", || self.ledger.get_message(message_id))
                .await?
                .map(|message| message.recipient_id);
        }
        task.message_id = response.message_id.clone();
        if task.correlation_id.is_none() {
            task.correlation_id = response.correlation_id.clone();
        }
        task.status = if response.success {
            Status::Completed
        } else {
            Status::Failed
        };
        task.result = response.data.clone();
        task.error = response.error.clone();
        task.updated_at = Utc::now();

        match self
            .retry
            .run("update_task", || self.ledger.update_task(&task))
            .await
        {
            Ok(()) => {}
            Err(e) if was_canceled(&e) => {
                tracing::info!(task_id = %task.id, "Task canceled while processing");
                return self.get_task(&task.id).await;
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            task_id = %task.id,
            message_id = ?task.message_id,
            agent_id = ?task.assigned_agent_id,
            status = %task.status,
            "Task finished"
        );
        Ok(task)
    }
}
