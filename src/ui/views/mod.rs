mod queue;

pub use queue::draw_queue;
