pub mod backend;
pub mod gateway;
pub mod load_balancer;
pub mod mapping;
pub mod protocol;
pub mod service_map;
pub mod uri_template;

pub use gateway::{GatewayService, ServiceRegistration};
pub use load_balancer::{LoadBalancer, LoadBalancerFactory, LoadBalancerKind};
pub use mapping::{HttpMappingRule, MappedServices, ServiceDetails};
pub use protocol::{ConnectionParameters, Detection, Protocol, ProtocolRegistry};
pub use service_map::ServiceMap;
