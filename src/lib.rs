//! Relay - Agent 对话执行引擎
//!
//! 模块划分：
//! - **bridge**: 执行桥（沙箱、响应标记协议、整轮超时、沙箱重启与取消）
//! - **chat**: 对话服务（一轮对话的主机侧驱动）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **conversation**: 消息模型与会话（草稿 / 持久）
//! - **core**: 错误分类、恢复策略、阶段跟踪、会话监管
//! - **engine**: 工具调用循环、系统提示词、进度事件
//! - **observability**: tracing 初始化
//! - **progress**: 进度摘要、明细与心跳
//! - **service**: 补全服务解析（候选、别名、HTTP 连接、脚本化测试服务）
//! - **session**: 会话持久化（staging 记录存储、分叉、标题）
//! - **tools**: 工具箱（注册表、schema、执行器、内置工具）

pub mod bridge;
pub mod chat;
pub mod config;
pub mod conversation;
pub mod core;
pub mod engine;
pub mod observability;
pub mod progress;
pub mod service;
pub mod session;
pub mod tools;

pub use chat::{ChatService, TurnReport};
