use async_trait::async_trait;

use super::InMemoryCoordinationStore;
use crate::domain::{ConfigParameter, ConfigValue, Result};
use crate::ports::ConfigStore;

#[async_trait]
impl ConfigStore for InMemoryCoordinationStore {
    async fn insert_parameter_if_absent(&self, parameter: &ConfigParameter) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.check_fault("insert_parameter_if_absent")?;
        if state.config.contains_key(&parameter.id) {
            return Ok(false);
        }
        state
            .config
            .insert(parameter.id.clone(), parameter.value.clone());
        Ok(true)
    }

    async fn get_parameter(&self, id: &str) -> Result<Option<ConfigValue>> {
        let mut state = self.state.lock().await;
        state.check_fault("get_parameter")?;
        Ok(state.config.get(id).cloned())
    }

    async fn set_parameter(&self, parameter: &ConfigParameter) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_fault("set_parameter")?;
        state
            .config
            .insert(parameter.id.clone(), parameter.value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ports::SystemClock;

    #[tokio::test]
    async fn insert_if_absent_keeps_operator_value() {
        let store = InMemoryCoordinationStore::new(Arc::new(SystemClock));
        let default = ConfigParameter::number("Defrag.PeriodSec", 5.0);

        assert!(store.insert_parameter_if_absent(&default).await.unwrap());
        store
            .set_parameter(&ConfigParameter::number("Defrag.PeriodSec", 30.0))
            .await
            .unwrap();
        assert!(!store.insert_parameter_if_absent(&default).await.unwrap());

        let value = store.get_parameter("Defrag.PeriodSec").await.unwrap();
        assert_eq!(value, Some(ConfigValue::Number(30.0)));
    }
}
