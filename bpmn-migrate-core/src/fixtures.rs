//! Canonical process shapes for tests and demos. Each returns a DTO so
//! callers can attach boundary events or bump the version before building.

use crate::model::ProcessDefinitionDto;

/// `start → userTask → end`
pub fn one_task() -> ProcessDefinitionDto {
    ProcessDefinitionDto::new("oneTask").task("userTask")
}

/// A task that is a scope in its own right.
pub fn scope_task() -> ProcessDefinitionDto {
    ProcessDefinitionDto::new("scopeTask").scope_task("userTask")
}

/// `fork → (userTask1 | userTask2) → join`
pub fn parallel_gateway() -> ProcessDefinitionDto {
    ProcessDefinitionDto::new("parallelGateway")
        .task("userTask1")
        .task("userTask2")
}

pub fn parallel_scope_tasks() -> ProcessDefinitionDto {
    ProcessDefinitionDto::new("parallelScopeTasks")
        .scope_task("userTask1")
        .scope_task("userTask2")
}

pub fn sub_process() -> ProcessDefinitionDto {
    ProcessDefinitionDto::new("subProcess")
        .sub_process("subProcess")
        .task_in("subProcess", "userTask")
}

pub fn scope_task_sub_process() -> ProcessDefinitionDto {
    ProcessDefinitionDto::new("scopeTaskSubProcess")
        .sub_process("subProcess")
        .scope_task_in("subProcess", "userTask")
}

/// Two sub processes side by side, one task each.
pub fn parallel_sub_process() -> ProcessDefinitionDto {
    ProcessDefinitionDto::new("parallelSubProcess")
        .sub_process("subProcess1")
        .task_in("subProcess1", "userTask1")
        .sub_process("subProcess2")
        .task_in("subProcess2", "userTask2")
}

/// One sub process forking into two tasks.
pub fn parallel_tasks_in_sub_process() -> ProcessDefinitionDto {
    ProcessDefinitionDto::new("parallelTasksSubProcess")
        .sub_process("subProcess")
        .task_in("subProcess", "userTask1")
        .task_in("subProcess", "userTask2")
}

/// Look a fixture up by name (CLI convenience).
pub fn by_name(name: &str) -> Option<ProcessDefinitionDto> {
    let dto = match name {
        "one-task" => one_task(),
        "scope-task" => scope_task(),
        "parallel-gateway" => parallel_gateway(),
        "parallel-scope-tasks" => parallel_scope_tasks(),
        "sub-process" => sub_process(),
        "scope-task-sub-process" => scope_task_sub_process(),
        "parallel-sub-process" => parallel_sub_process(),
        "parallel-tasks-sub-process" => parallel_tasks_in_sub_process(),
        _ => return None,
    };
    Some(dto)
}

pub const NAMES: &[&str] = &[
    "one-task",
    "scope-task",
    "parallel-gateway",
    "parallel-scope-tasks",
    "sub-process",
    "scope-task-sub-process",
    "parallel-sub-process",
    "parallel-tasks-sub-process",
];
