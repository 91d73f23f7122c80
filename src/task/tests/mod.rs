//! Task 调度单元测试
//!
//! 测试 futex、信号量、PMutex 和任务注册表的行为


use crate::task::TaskId;

#[test]
fn test_task_id_display() {
    let id = TaskId(7);
    assert_eq!(format!("{}", id), "Task(7)");
    assert_eq!(id.inner(), 7);
}

#[test]
fn test_task_id_eq() {
    assert_eq!(TaskId(1), TaskId(1));
    assert_ne!(TaskId(1), TaskId(2));
}
