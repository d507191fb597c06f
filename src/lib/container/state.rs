use std::collections::HashMap;

use super::types::ContainerState;

pub fn valid_state_transition(src: &ContainerState, dst: &ContainerState) -> bool {
    let state_transition_map: HashMap<ContainerState, Vec<ContainerState>> = {
        let mut map = HashMap::new();
        map.insert(
            ContainerState::Unknown,
            vec![ContainerState::Starting, ContainerState::Missing, ContainerState::Stopped],
        );
        map.insert(
            ContainerState::Missing,
            vec![ContainerState::Starting, ContainerState::Missing],
        );
        map.insert(
            ContainerState::Stopped,
            vec![ContainerState::Starting, ContainerState::Missing, ContainerState::Stopped],
        );
        map.insert(
            ContainerState::Starting,
            vec![ContainerState::Running, ContainerState::Stopped, ContainerState::Missing],
        );
        map.insert(
            ContainerState::Running,
            vec![
                ContainerState::Running,
                ContainerState::Stopped,
                ContainerState::Missing,
                ContainerState::Starting,
            ],
        );
        map
    };

    state_transition_map
        .get(src)
        .is_some_and(|valid_states| valid_states.contains(dst))
}
