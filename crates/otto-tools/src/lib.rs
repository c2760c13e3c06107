// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod permission;
mod registry;
mod tool;

pub use permission::{
    pattern_matches, AllowAll, BackgroundChecker, PermissionBehavior, PermissionChecker,
    PermissionResult, SkillScope, SkillScopeChecker,
};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{Tool, ToolCall, ToolOutput};
