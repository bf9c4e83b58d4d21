//! Queen与Drone之间的线上消息定义
//!
//! 负载格式为protobuf，外层由`framing`模块加4字节长度前缀。

use bytes::Bytes;

use crate::drone::{TaskError, TaskOutcome};

/// Drone连接后发送的第一条消息
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
    /// 节点持久标识，用于关联负载均衡器状态
    #[prost(string, tag = "1")]
    pub worker_uuid: ::prost::alloc::string::String,
    /// 执行线程数
    #[prost(uint32, tag = "2")]
    pub threads: u32,
    /// 节点版本（CARGO_PKG_VERSION）
    #[prost(string, tag = "3")]
    pub version: ::prost::alloc::string::String,
}

/// 单个任务的序列化负载
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskEnvelope {
    /// 任务在作业内的位置
    #[prost(uint32, tag = "1")]
    pub position: u32,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
}

/// 任务包
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BundleFrame {
    #[prost(string, tag = "1")]
    pub job_uuid: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub bundle_id: u64,
    /// 代码解析服务使用的应用标识
    #[prost(string, tag = "3")]
    pub app_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub job_name: ::prost::alloc::string::String,
    /// 作业内所有任务共享的只读数据
    #[prost(bytes = "bytes", tag = "5")]
    pub data_provider: Bytes,
    #[prost(message, repeated, tag = "6")]
    pub tasks: ::prost::alloc::vec::Vec<TaskEnvelope>,
    #[prost(int32, tag = "7")]
    pub priority: i32,
}

/// 取消某作业在该节点上的全部任务包
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelFrame {
    #[prost(string, tag = "1")]
    pub job_uuid: ::prost::alloc::string::String,
    /// 中断前先调用任务的取消回调
    #[prost(bool, tag = "2")]
    pub call_on_cancel: bool,
    /// 被取消的任务回到队列，作业转为挂起
    #[prost(bool, tag = "3")]
    pub requeue: bool,
}

/// 任务失败信息
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskFailure {
    #[prost(string, tag = "1")]
    pub kind: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

/// 单个任务的执行结果
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskResult {
    #[prost(uint32, tag = "1")]
    pub position: u32,
    #[prost(oneof = "task_result::Outcome", tags = "2, 3, 4, 5")]
    pub outcome: ::core::option::Option<task_result::Outcome>,
}
/// Nested message and enum types in `TaskResult`.
pub mod task_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        /// 成功时的输出
        #[prost(bytes, tag = "2")]
        Output(::prost::alloc::vec::Vec<u8>),
        /// 失败时的错误信息
        #[prost(message, tag = "3")]
        Error(super::TaskFailure),
        #[prost(bool, tag = "4")]
        Cancelled(bool),
        #[prost(bool, tag = "5")]
        TimedOut(bool),
    }
}

/// 一个任务包的批量结果
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResultsFrame {
    #[prost(string, tag = "1")]
    pub job_uuid: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub bundle_id: u64,
    #[prost(message, repeated, tag = "3")]
    pub results: ::prost::alloc::vec::Vec<TaskResult>,
    /// 取消时要求回队
    #[prost(bool, tag = "4")]
    pub requeue: bool,
    /// Drone端执行耗时(纳秒)
    #[prost(uint64, tag = "5")]
    pub execution_nanos: u64,
    /// 作业级错误(例如线程池不可用)
    #[prost(string, optional, tag = "6")]
    pub failure: ::core::option::Option<::prost::alloc::string::String>,
}

/// Queen -> Drone
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToDrone {
    #[prost(oneof = "to_drone::Kind", tags = "1, 2")]
    pub kind: ::core::option::Option<to_drone::Kind>,
}
/// Nested message and enum types in `ToDrone`.
pub mod to_drone {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Bundle(super::BundleFrame),
        #[prost(message, tag = "2")]
        Cancel(super::CancelFrame),
    }
}

/// Drone -> Queen
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToQueen {
    #[prost(oneof = "to_queen::Kind", tags = "1, 2")]
    pub kind: ::core::option::Option<to_queen::Kind>,
}
/// Nested message and enum types in `ToQueen`.
pub mod to_queen {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Hello(super::Hello),
        #[prost(message, tag = "2")]
        Results(super::ResultsFrame),
    }
}

impl ToDrone {
    pub fn bundle(frame: BundleFrame) -> Self {
        Self {
            kind: Some(to_drone::Kind::Bundle(frame)),
        }
    }

    pub fn cancel(frame: CancelFrame) -> Self {
        Self {
            kind: Some(to_drone::Kind::Cancel(frame)),
        }
    }
}

impl ToQueen {
    pub fn hello(hello: Hello) -> Self {
        Self {
            kind: Some(to_queen::Kind::Hello(hello)),
        }
    }

    pub fn results(frame: ResultsFrame) -> Self {
        Self {
            kind: Some(to_queen::Kind::Results(frame)),
        }
    }
}

impl TaskResult {
    pub fn new(position: u32, outcome: &TaskOutcome) -> Self {
        use task_result::Outcome;
        let outcome = match outcome {
            TaskOutcome::Completed(output) => Outcome::Output(output.to_vec()),
            TaskOutcome::Failed(err) => Outcome::Error(TaskFailure {
                kind: err.kind().to_string(),
                message: err.message(),
            }),
            TaskOutcome::Cancelled => Outcome::Cancelled(true),
            TaskOutcome::TimedOut => Outcome::TimedOut(true),
        };
        Self {
            position,
            outcome: Some(outcome),
        }
    }

    /// 还原为任务结果；缺少结果字段的条目按失败处理
    pub fn to_outcome(&self) -> TaskOutcome {
        use task_result::Outcome;
        match &self.outcome {
            Some(Outcome::Output(output)) => TaskOutcome::Completed(Bytes::from(output.clone())),
            Some(Outcome::Error(failure)) => {
                TaskOutcome::Failed(TaskError::from_parts(&failure.kind, &failure.message))
            }
            Some(Outcome::Cancelled(_)) => TaskOutcome::Cancelled,
            Some(Outcome::TimedOut(_)) => TaskOutcome::TimedOut,
            None => TaskOutcome::Failed(TaskError::Missing),
        }
    }
}
