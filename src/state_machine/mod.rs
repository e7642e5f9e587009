// State machine module for task execution runs
//
// A run moves created -> pre_handling -> executing -> post_handling and ends
// in completed or fault. Transitions are pure; the driver in
// orchestration::task_manager applies them around the manager hooks.

pub mod errors;
pub mod events;
pub mod execution_state_machine;
pub mod states;

// Re-export main types for convenient access
pub use errors::{StateMachineError, StateMachineResult};
pub use events::ExecutionEvent;
pub use execution_state_machine::{determine_target_state, ExecutionStateMachine, TransitionRecord};
pub use states::ExecutionState;
