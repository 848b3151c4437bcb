use std::collections::HashMap;

use rand::RngCore;
use tch::{nn, Kind, Tensor};

use crate::augment::{Augment, RandomResizedCrop};
use crate::backbone::Backbone;
use crate::config::{EsVitConfig, LOCAL_LOWER_CROP_SCALE};
use crate::error::Result;

const EPS: f64 = 1e-20;

/// View-level self-distillation loss: cross entropy between the centred,
/// sharpened teacher distribution and the student distribution.
pub fn view_loss(
    teacher_logits: &Tensor,
    student_logits: &Tensor,
    teacher_temp: f64,
    student_temp: f64,
    centers: &Tensor,
) -> Tensor {
    let teacher_logits = teacher_logits.detach();
    let student_probs = (student_logits / student_temp).softmax(-1, Kind::Float);
    let teacher_probs = ((teacher_logits - centers) / teacher_temp).softmax(-1, Kind::Float);
    -(teacher_probs * (student_probs + EPS).log())
        .sum_dim_intlist(Some(&[-1][..]), false, Kind::Float)
        .mean(Kind::Float)
}

/// Region-level loss: every student region is matched with the teacher
/// region whose latent is most similar, and distils from that region.
///
/// logits: [batch, regions, K], latents: [batch, regions, dim]
pub fn region_loss(
    teacher_logits: &Tensor,
    student_logits: &Tensor,
    teacher_latent: &Tensor,
    student_latent: &Tensor,
    teacher_temp: f64,
    student_temp: f64,
    centers: &Tensor,
) -> Tensor {
    let teacher_logits = teacher_logits.detach();
    let student_probs = (student_logits / student_temp).softmax(-1, Kind::Float);
    let teacher_probs = ((teacher_logits - centers) / teacher_temp).softmax(-1, Kind::Float);

    let sim = student_latent.matmul(&teacher_latent.transpose(1, 2));
    let k = teacher_probs.size()[2];
    let sim_indices = sim.argmax(-1, false).unsqueeze(-1).expand([-1, -1, k], false);
    let max_sim_teacher_probs = teacher_probs.gather(1, &sim_indices, false);

    -(max_sim_teacher_probs * (student_probs + EPS).log())
        .sum_dim_intlist(Some(&[-1][..]), false, Kind::Float)
        .mean(Kind::Float)
}

/// Projection MLP: GELU hidden layers, L2 normalisation, linear output.
#[derive(Debug)]
pub struct ProjectionHead {
    layers: Vec<nn::Linear>,
    out: nn::Linear,
}

impl ProjectionHead {
    pub fn new(vs: &nn::Path, dim: i64, dim_out: i64, num_layers: i64, hidden_size: i64) -> Self {
        let mut dims = vec![dim];
        dims.extend(std::iter::repeat(hidden_size).take((num_layers - 1).max(0) as usize));

        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, pair)| nn::linear(vs / "layers" / i, pair[0], pair[1], Default::default()))
            .collect();
        let last = *dims.last().unwrap_or(&dim);
        let out = nn::linear(vs / "out", last, dim_out, Default::default());

        Self { layers, out }
    }

    /// x: [..., dim] -> [..., dim_out]
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let mut x = x.shallow_clone();
        for layer in &self.layers {
            x = x.apply(layer).gelu("none");
        }
        let norm = x
            .pow_tensor_scalar(2.0)
            .sum_dim_intlist(Some(&[-1][..]), true, Kind::Float)
            .sqrt()
            .clamp_min(1e-6);
        (x / norm).apply(&self.out)
    }
}

/// Projections produced by a [`NetWrapper`] for one batch.
#[derive(Debug)]
pub struct Projections {
    /// [batch, K]
    pub view: Tensor,
    /// [batch, regions, K]
    pub region: Tensor,
    /// [batch, regions, dim]
    pub region_latents: Tensor,
}

/// A backbone with view-level and region-level projection heads on top of
/// its last feature map.
#[derive(Debug)]
pub struct NetWrapper<B: Backbone> {
    pub net: B,
    view_projector: ProjectionHead,
    region_projector: ProjectionHead,
}

impl<B: Backbone> NetWrapper<B> {
    pub fn new(vs: &nn::Path, net: B, config: &EsVitConfig) -> Self {
        let dim = net.feature_dim();
        let head = |name: &str| {
            ProjectionHead::new(
                &(vs / name),
                dim,
                config.num_classes_k,
                config.projection_layers,
                config.projection_hidden_size,
            )
        };
        let view_projector = head("view_projector");
        let region_projector = head("region_projector");
        Self {
            net,
            view_projector,
            region_projector,
        }
    }

    /// Returns `(global_latent [b, c], region_latents [b, c, h, w])`.
    pub fn embed(&self, x: &Tensor, train: bool) -> (Tensor, Tensor) {
        let regions = self.net.features(x, train);
        let global = regions.mean_dim(Some(&[2, 3][..]), false, Kind::Float);
        (global, regions)
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Projections {
        let (global, regions) = self.embed(x, train);
        // b c h w -> b (h w) c
        let region_latents = regions.flatten(2, -1).transpose(1, 2);
        Projections {
            view: self.view_projector.forward(&global),
            region: self.region_projector.forward(&region_latents),
            region_latents,
        }
    }
}

struct SharedVariable {
    teacher: Tensor,
    student: Tensor,
    trainable: bool,
}

/// EsViT self-supervised learner: a student trained on local crops distils
/// from an EMA teacher that sees global crops.
pub struct EsVitLearner<B: Backbone> {
    student: NetWrapper<B>,
    teacher: NetWrapper<B>,
    teacher_vs: nn::VarStore,
    shared: Vec<SharedVariable>,
    view_centers: Tensor,
    last_view_centers: Tensor,
    region_centers: Tensor,
    last_region_centers: Tensor,
    augment1: Augment,
    augment2: Augment,
    local_crop: RandomResizedCrop,
    global_crop: RandomResizedCrop,
    config: EsVitConfig,
}

impl<B: Backbone> std::fmt::Debug for EsVitLearner<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsVitLearner")
            .field("student", &self.student.net)
            .field("shared_variables", &self.shared.len())
            .field("config", &self.config)
            .finish()
    }
}

impl<B: Backbone> EsVitLearner<B> {
    /// Builds the student under `vs` and a frozen teacher copy of identical
    /// structure in a private store. `build` must construct the same
    /// backbone every time it is called.
    pub fn new<F>(vs: &nn::VarStore, config: &EsVitConfig, build: F) -> Result<Self>
    where
        F: Fn(&nn::Path) -> Result<B>,
    {
        config.validate()?;

        let root = vs.root();
        let student_path = &root / "student";
        let student = NetWrapper::new(&student_path, build(&(&student_path / "net"))?, config);

        let mut teacher_vs = nn::VarStore::new(vs.device());
        let teacher = {
            let teacher_root = teacher_vs.root();
            let teacher_path = &teacher_root / "student";
            NetWrapper::new(&teacher_path, build(&(&teacher_path / "net"))?, config)
        };

        let k = config.num_classes_k;
        let view_centers = root.zeros_no_train("teacher_view_centers", &[1, k]);
        let last_view_centers = root.zeros_no_train("last_teacher_view_centers", &[1, k]);
        let region_centers = root.zeros_no_train("teacher_region_centers", &[1, k]);
        let last_region_centers = root.zeros_no_train("last_teacher_region_centers", &[1, k]);

        let student_vars = vs.variables();
        let shared = teacher_vs
            .variables()
            .into_iter()
            .filter_map(|(name, teacher)| {
                student_vars.get(&name).map(|student| SharedVariable {
                    teacher,
                    student: student.shallow_clone(),
                    trainable: student.requires_grad(),
                })
            })
            .collect();

        let mut learner = Self {
            student,
            teacher,
            teacher_vs,
            shared,
            view_centers,
            last_view_centers,
            region_centers,
            last_region_centers,
            augment1: Augment::byol_default(),
            augment2: Augment::byol_default(),
            local_crop: RandomResizedCrop::new(
                config.image_size,
                (LOCAL_LOWER_CROP_SCALE, config.local_upper_crop_scale),
            ),
            global_crop: RandomResizedCrop::new(config.image_size, (config.global_lower_crop_scale, 1.0)),
            config: config.clone(),
        };
        learner.reset_moving_average();
        learner.teacher_vs.freeze();
        log::debug!("es-vit teacher shares {} variables with the student", learner.shared.len());

        Ok(learner)
    }

    /// Replaces the default view augmentations.
    pub fn with_augmentations(mut self, augment1: Augment, augment2: Augment) -> Self {
        self.augment1 = augment1;
        self.augment2 = augment2;
        self
    }

    pub fn config(&self) -> &EsVitConfig {
        &self.config
    }

    pub fn student(&self) -> &NetWrapper<B> {
        &self.student
    }

    pub fn teacher_store(&self) -> &nn::VarStore {
        &self.teacher_vs
    }

    pub fn teacher_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.teacher_vs
    }

    /// Student latents without projection.
    pub fn embed(&self, x: &Tensor, train: bool) -> (Tensor, Tensor) {
        self.student.embed(x, train)
    }

    pub fn loss(&mut self, x: &Tensor, rng: &mut dyn RngCore, train: bool) -> Tensor {
        self.loss_with_temperatures(x, rng, train, None, None)
    }

    pub fn loss_with_temperatures(
        &mut self,
        x: &Tensor,
        rng: &mut dyn RngCore,
        train: bool,
        student_temp: Option<f64>,
        teacher_temp: Option<f64>,
    ) -> Tensor {
        let student_temp = student_temp.unwrap_or(self.config.student_temp);
        let teacher_temp = teacher_temp.unwrap_or(self.config.teacher_temp);

        let image_one = self.augment1.apply(x, rng);
        let image_two = self.augment2.apply(x, rng);

        let local_one = self.local_crop.apply(&image_one, rng);
        let local_two = self.local_crop.apply(&image_two, rng);
        let global_one = self.global_crop.apply(&image_one, rng);
        let global_two = self.global_crop.apply(&image_two, rng);

        let student_one = self.student.forward(&local_one, train);
        let student_two = self.student.forward(&local_two, train);

        let (teacher_one, teacher_two) = tch::no_grad(|| {
            (
                self.teacher.forward(&global_one, train),
                self.teacher.forward(&global_two, train),
            )
        });

        tch::no_grad(|| {
            let view_avg = Tensor::cat(&[&teacher_one.view, &teacher_two.view], 0)
                .mean_dim(Some(&[0][..]), true, Kind::Float);
            self.last_view_centers.copy_(&view_avg);

            let region_avg = Tensor::cat(&[&teacher_one.region, &teacher_two.region], 0)
                .mean_dim(Some(&[0, 1][..]), false, Kind::Float)
                .unsqueeze(0);
            self.last_region_centers.copy_(&region_avg);
        });

        let views = |teacher: &Projections, student: &Projections| {
            view_loss(&teacher.view, &student.view, teacher_temp, student_temp, &self.view_centers)
        };
        let regions = |teacher: &Projections, student: &Projections| {
            region_loss(
                &teacher.region,
                &student.region,
                &teacher.region_latents,
                &student.region_latents,
                teacher_temp,
                student_temp,
                &self.region_centers,
            )
        };

        let view = (views(&teacher_one, &student_two) + views(&teacher_two, &student_one)) / 2.0;
        let region = (regions(&teacher_one, &student_two) + regions(&teacher_two, &student_one)) / 2.0;

        (view + region) / 2.0
    }

    /// EMA of the teacher parameters towards the student, then EMA of the
    /// centres towards the last observed teacher means.
    pub fn update_moving_average(&mut self) {
        let beta = self.config.moving_average_decay;
        let center_beta = self.config.center_moving_average_decay;

        tch::no_grad(|| {
            for var in self.shared.iter_mut().filter(|v| v.trainable) {
                let updated = &var.teacher * beta + &var.student * (1.0 - beta);
                var.teacher.copy_(&updated);
            }

            let view = &self.view_centers * center_beta + &self.last_view_centers * (1.0 - center_beta);
            self.view_centers.copy_(&view);

            let region = &self.region_centers * center_beta + &self.last_region_centers * (1.0 - center_beta);
            self.region_centers.copy_(&region);
        });
    }

    /// Re-initialises the teacher (parameters and buffers) from the student.
    pub fn reset_moving_average(&mut self) {
        tch::no_grad(|| {
            for var in self.shared.iter_mut() {
                var.teacher.copy_(&var.student);
            }
        });
    }

    pub fn centers(&self) -> HashMap<&'static str, &Tensor> {
        HashMap::from([
            ("view", &self.view_centers),
            ("last_view", &self.last_view_centers),
            ("region", &self.region_centers),
            ("last_region", &self.last_region_centers),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaxVitConfig;
    use crate::max_vit::MaxVit;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tch::nn::OptimizerConfig;
    use tch::Device;

    fn tiny_backbone() -> MaxVitConfig {
        MaxVitConfig {
            num_classes: 4,
            dim: 8,
            depth: vec![1],
            dim_head: 4,
            window_size: 2,
            mbconv_expansion_rate: 1.0,
            dropout: 0.0,
            num_register_tokens: 1,
            ..Default::default()
        }
    }

    fn tiny_es_vit() -> EsVitConfig {
        EsVitConfig {
            image_size: 8,
            projection_hidden_size: 16,
            num_classes_k: 12,
            projection_layers: 2,
            ..Default::default()
        }
    }

    fn learner(vs: &nn::VarStore) -> EsVitLearner<MaxVit> {
        let backbone = tiny_backbone();
        EsVitLearner::new(vs, &tiny_es_vit(), |path| MaxVit::new(path, &backbone)).unwrap()
    }

    #[test]
    fn view_loss_matches_manual_cross_entropy() {
        let teacher = Tensor::from_slice(&[2.0f32, 0.0]).view([1, 2]);
        let student = Tensor::from_slice(&[0.0f32, 0.0]).view([1, 2]);
        let centers = Tensor::zeros([1, 2], (Kind::Float, Device::Cpu));
        let loss = view_loss(&teacher, &student, 1.0, 1.0, &centers).double_value(&[]);
        // Uniform student: -(p0 + p1) * ln(0.5) = ln 2
        assert!((loss - std::f64::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn region_loss_uses_most_similar_teacher_region() {
        // Two regions; the student's first region matches the teacher's second.
        let teacher_latent = Tensor::from_slice(&[1.0f32, 0.0, 0.0, 1.0]).view([1, 2, 2]);
        let student_latent = Tensor::from_slice(&[0.0f32, 1.0, 0.0, 1.0]).view([1, 2, 2]);
        let teacher_logits = Tensor::from_slice(&[10.0f32, -10.0, -10.0, 10.0]).view([1, 2, 2]);
        let student_logits = Tensor::from_slice(&[-10.0f32, 10.0, -10.0, 10.0]).view([1, 2, 2]);
        let centers = Tensor::zeros([1, 2], (Kind::Float, Device::Cpu));

        let matched = region_loss(
            &teacher_logits,
            &student_logits,
            &teacher_latent,
            &student_latent,
            1.0,
            1.0,
            &centers,
        )
        .double_value(&[]);
        assert!(matched < 1e-3, "matched regions should agree, got {}", matched);

        let mismatched = view_loss(
            &teacher_logits.select(1, 0),
            &student_logits.select(1, 0),
            1.0,
            1.0,
            &centers,
        )
        .double_value(&[]);
        assert!(mismatched > 1.0);
    }

    #[test]
    fn projection_head_shapes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = ProjectionHead::new(&vs.root(), 8, 5, 3, 16);
        let x = Tensor::randn([4, 8], (Kind::Float, Device::Cpu));
        assert_eq!(head.forward(&x).size(), vec![4, 5]);
        let regions = Tensor::randn([2, 6, 8], (Kind::Float, Device::Cpu));
        assert_eq!(head.forward(&regions).size(), vec![2, 6, 5]);

        let single = ProjectionHead::new(&(vs.root() / "single"), 8, 5, 1, 16);
        assert_eq!(single.forward(&x).size(), vec![4, 5]);
    }

    #[test]
    fn teacher_starts_as_student_copy() {
        let vs = nn::VarStore::new(Device::Cpu);
        let learner = learner(&vs);
        let student = vs.variables();
        for (name, teacher) in learner.teacher_store().variables() {
            assert!(teacher.equal(&student[&name]), "{} differs", name);
            assert!(!teacher.requires_grad());
        }
    }

    #[test]
    fn embed_returns_global_and_region_latents() {
        let vs = nn::VarStore::new(Device::Cpu);
        let learner = learner(&vs);
        let x = Tensor::rand([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let (global, regions) = learner.embed(&x, false);
        assert_eq!(global.size(), vec![2, 8]);
        assert_eq!(regions.size(), vec![2, 8, 2, 2]);
    }

    #[test]
    fn training_step_moves_teacher_and_centres() {
        tch::manual_seed(1);
        let vs = nn::VarStore::new(Device::Cpu);
        let mut learner = learner(&vs);
        let mut opt = nn::Adam::default().build(&vs, 1e-2).unwrap();
        let mut rng = StdRng::seed_from_u64(5);

        let x = Tensor::rand([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let loss = learner.loss(&x, &mut rng, true);
        assert!(loss.double_value(&[]).is_finite());
        opt.backward_step(&loss);

        let before = learner.teacher_store().variables();
        let before: HashMap<String, Tensor> = before.into_iter().map(|(k, v)| (k, v.copy())).collect();
        learner.update_moving_average();

        let student = vs.variables();
        let mut moved = 0;
        for (name, teacher) in learner.teacher_store().variables() {
            if !teacher.equal(&before[&name]) {
                moved += 1;
                // teacher lies between its old value and the student
                let expected = &before[&name] * 0.9 + &student[&name] * 0.1;
                assert!(teacher.allclose(&expected, 1e-5, 1e-6, false));
            }
        }
        assert!(moved > 0);

        let centers = learner.centers();
        let expected = centers["last_view"] * 0.1;
        assert!(centers["view"].allclose(&expected, 1e-5, 1e-6, false));
    }

    #[test]
    fn reset_copies_student_back_into_teacher() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut learner = learner(&vs);
        tch::no_grad(|| {
            for (_, mut var) in vs.variables() {
                let _ = var.fill_(0.5);
            }
        });
        learner.reset_moving_average();
        let student = vs.variables();
        for (name, teacher) in learner.teacher_store().variables() {
            assert!(teacher.equal(&student[&name]));
        }
    }

    #[test]
    fn temperature_overrides_change_the_loss() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut learner = learner(&vs);
        let x = Tensor::rand([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let mut loss_at = |student_temp: Option<f64>, teacher_temp: Option<f64>| {
            let mut rng = StdRng::seed_from_u64(9);
            learner
                .loss_with_temperatures(&x, &mut rng, false, student_temp, teacher_temp)
                .double_value(&[])
        };

        let configured = loss_at(None, None);
        let explicit = loss_at(Some(0.9), Some(0.04));
        let sharper = loss_at(None, Some(0.5));
        assert!((configured - explicit).abs() < 1e-6);
        assert!((configured - sharper).abs() > 1e-6);
    }
}
