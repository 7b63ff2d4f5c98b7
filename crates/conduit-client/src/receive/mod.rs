// Flow-controlled receive side: subscriber contract, pipeline and pull adapter.
pub mod pipeline;
pub mod receiver;
pub mod subscriber;

pub use self::pipeline::{
    BufferedHook, CreditSupplier, InboundLink, PipelineOptions, ReceivePipeline, UNBOUNDED,
};
pub use self::receiver::EventReceiver;
pub use self::subscriber::{Subscriber, Subscription};
