pub mod balancer;
pub mod formatter;
pub mod merger;
pub mod pipeline;
pub mod sharded;
pub mod token_bucket;

pub use balancer::{Balancer, BalancerError, Target};
pub use formatter::EntityFormatter;
pub use pipeline::{PipelineError, PipelineRequest, PipelineResponse, Proxy, ProxyFactory};
pub use sharded::ShardedCache;
pub use token_bucket::TokenBucket;
