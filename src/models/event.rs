use serde::{Deserialize, Serialize};

use super::container::{Container, ContainerState};

/// A lifecycle transition, carrying the container as it was at that moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "container", rename_all = "snake_case")]
pub enum Event {
    Reserved(Container),
    Initializing(Container),
    Created(Container),
    Running(Container),
    Complete(Container),
}

impl Event {
    pub fn for_container(container: &Container) -> Self {
        let container = container.clone();
        match container.state {
            ContainerState::Reserved => Event::Reserved(container),
            ContainerState::Initializing => Event::Initializing(container),
            ContainerState::Created => Event::Created(container),
            ContainerState::Running => Event::Running(container),
            ContainerState::Completed => Event::Complete(container),
        }
    }

    pub fn container(&self) -> &Container {
        match self {
            Event::Reserved(c)
            | Event::Initializing(c)
            | Event::Created(c)
            | Event::Running(c)
            | Event::Complete(c) => c,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Event::Reserved(_) => "reserved",
            Event::Initializing(_) => "initializing",
            Event::Created(_) => "created",
            Event::Running(_) => "running",
            Event::Complete(_) => "complete",
        }
    }
}
