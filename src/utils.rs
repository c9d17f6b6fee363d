pub trait Condition {
    fn type_(&self) -> &str;
    fn status(&self) -> &str;
    fn reason(&self) -> Option<&str>;
}

pub fn upsert_condition<T: Condition>(conditions: &mut Vec<T>, new_condition: T) {
    if let Some(existing_condition) = conditions
        .iter_mut()
        .find(|c| c.type_() == new_condition.type_())
    {
        // Skip change if we can't see a difference in the new value
        if existing_condition.status() == new_condition.status()
            && existing_condition.reason() == new_condition.reason()
        {
            return;
        }

        *existing_condition = new_condition;
    } else {
        conditions.push(new_condition);
    }
}
