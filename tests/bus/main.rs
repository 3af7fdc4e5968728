mod support;

mod delivery;
mod listener;
mod request_reply;
mod resiliency;
mod routing;
#[cfg(feature = "tcp")]
mod tcp;
mod worker_queues;
